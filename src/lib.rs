pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod extract;
pub mod ftp;
pub mod ledger;
pub mod pipeline;
pub mod report;
pub mod store;

pub use config::{Config, Opts};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
