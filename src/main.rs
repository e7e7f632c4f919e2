use clap::Parser;
use env_logger::Env;

use facesnap::cli::SubCommandExtend;
use facesnap::config::{Opts, SubCommand};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    match &opts.subcmd {
        SubCommand::Run(cmd) => cmd.run(&opts),
        SubCommand::Fetch(cmd) => cmd.run(&opts),
        SubCommand::Cluster(cmd) => cmd.run(&opts),
        SubCommand::Status(cmd) => cmd.run(&opts),
        SubCommand::Report(cmd) => cmd.run(&opts),
    }
}
