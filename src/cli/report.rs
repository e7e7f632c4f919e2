use std::fs;

use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::cluster::load_labels;
use crate::config::{Config, Opts};
use crate::report::{HtmlReporter, Reporter};
use crate::store::FeatureStore;

#[derive(Parser, Debug, Clone)]
pub struct ReportCommand {
    /// 保留指向本地不存在图片的缩略图
    #[arg(long)]
    pub keep_missing: bool,
}

impl SubCommandExtend for ReportCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let config = Config::load(&opts.config)?;
        let data = config.data_dir();

        let store = FeatureStore::open_default(&data)?;
        let labels = load_labels(data.labels())?;
        let reporter = HtmlReporter { check_files: !self.keep_missing };
        let html = reporter.render(&labels, &store.paths()?);
        fs::write(data.report(), html)?;
        println!("{}", data.report().display());
        Ok(())
    }
}
