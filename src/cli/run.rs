use anyhow::Result;
use clap::Parser;
use log::info;

use crate::Pipeline;
use crate::cli::SubCommandExtend;
use crate::config::{Config, Opts};

#[derive(Parser, Debug, Clone)]
pub struct RunCommand {
    /// 只执行一个周期后退出，不进入轮询
    #[arg(long)]
    pub once: bool,
}

impl SubCommandExtend for RunCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let config = Config::load(&opts.config)?;
        let mut pipeline = Pipeline::new(config)?;
        if self.once {
            let summary = pipeline.run_cycle();
            info!(
                "周期完成: 下载 {} / 提取 {} / 合并 {} / {} 个簇 / {} 个陌生人",
                summary.downloaded,
                summary.extracted,
                summary.merged,
                summary.clusters,
                summary.outliers
            );
        } else {
            pipeline.run();
        }
        Ok(())
    }
}
