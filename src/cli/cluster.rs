use std::fs;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::cluster::{Clusterer, Dbscan, save_labels};
use crate::config::{Config, Opts};
use crate::report::{HtmlReporter, Reporter};
use crate::store::FeatureStore;

#[derive(Parser, Debug, Clone)]
pub struct ClusterCommand {
    /// 只聚类，不重新渲染报告
    #[arg(long)]
    pub no_report: bool,
}

impl SubCommandExtend for ClusterCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let config = Config::load(&opts.config)?;
        let data = config.data_dir();

        let store = FeatureStore::open_default(&data)?;
        let matrix = store.load_matrix()?;
        let labels = Dbscan::from_config(&config.clustering).cluster(matrix.view());
        save_labels(data.labels(), &labels)?;

        if !self.no_report {
            let html = HtmlReporter::default().render(&labels, &store.paths()?);
            fs::write(data.report(), html)?;
            info!("聚类报告已生成: {}", data.report().display());
        }
        Ok(())
    }
}
