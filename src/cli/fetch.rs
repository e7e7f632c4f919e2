use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{Config, Opts};
use crate::ftp::{Downloader, FtpSession};
use crate::ledger::ProcessedLedger;

#[derive(Parser, Debug, Clone)]
pub struct FetchCommand {}

impl SubCommandExtend for FetchCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let config = Config::load(&opts.config)?;
        let data = config.data_dir();

        let mut ledger = ProcessedLedger::load(data.ledger())?;
        let session = FtpSession::connect(&config.ftp)?;
        let mut downloader = Downloader::new(
            session,
            config.ftp.max_retries,
            Duration::from_secs(config.ftp.retry_delay),
        );
        let downloaded =
            downloader.download_new(&data.images(), &config.system.marker, &mut ledger)?;
        ledger.persist(data.ledger())?;

        for name in &downloaded {
            println!("{}", name);
        }
        Ok(())
    }
}
