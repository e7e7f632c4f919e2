mod cluster;
mod fetch;
mod report;
mod run;
mod status;

pub use cluster::*;
pub use fetch::*;
pub use report::*;
pub use run::*;
pub use status::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> anyhow::Result<()>;
}
