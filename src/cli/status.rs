use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde_json::json;

use crate::cli::SubCommandExtend;
use crate::config::{Config, Opts};
use crate::ledger::{FileState, ProcessedLedger};
use crate::store::FeatureStore;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug, Clone)]
pub struct StatusCommand {
    /// 输出格式
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

impl SubCommandExtend for StatusCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let config = Config::load(&opts.config)?;
        let data = config.data_dir();

        let store = FeatureStore::open_default(&data)?;
        let ledger = ProcessedLedger::load(data.ledger())?;
        let labels = crate::cluster::load_labels(data.labels()).unwrap_or_default();

        let count_state = |state: FileState| {
            ledger.filenames().filter(|name| ledger.state(name) == Some(state)).count()
        };
        let downloaded = count_state(FileState::Downloaded);
        let extracted = count_state(FileState::Extracted);
        let skipped = count_state(FileState::Skipped);

        match self.format {
            OutputFormat::Table => {
                println!("features\t{}", store.count());
                println!("labels\t{}", labels.len());
                println!("ledger\t{}", ledger.len());
                println!("  downloaded\t{}", downloaded);
                println!("  extracted\t{}", extracted);
                println!("  skipped\t{}", skipped);
            }
            OutputFormat::Json => {
                let status = json!({
                    "features": store.count(),
                    "labels": labels.len(),
                    "ledger": {
                        "total": ledger.len(),
                        "downloaded": downloaded,
                        "extracted": extracted,
                        "skipped": skipped,
                    },
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        }
        Ok(())
    }
}
