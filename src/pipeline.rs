use std::fmt;
use std::fs;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::cluster::{Clusterer, Dbscan, OUTLIER, save_labels};
use crate::config::{Config, DataDir, FtpConfig};
use crate::error::Result;
use crate::extract::{CommandExtractor, ExtractBatch, FaceExtractor, extract_new};
use crate::ftp::{Downloader, FtpSession, RemoteSession};
use crate::ledger::{FileState, ProcessedLedger};
use crate::report::{HtmlReporter, Reporter};
use crate::store::{EMBEDDING_DIM, FeatureStore};

/// 轮询周期内的阶段，按固定顺序推进
///
/// 没有错误状态：任何阶段出错都只记录日志，周期继续走完。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Downloading,
    Extracting,
    Merging,
    Clustering,
    PersistingLedger,
    Reporting,
    Sleeping,
}

impl Stage {
    /// 下一个阶段，转移无条件发生
    pub fn next(self) -> Stage {
        match self {
            Stage::Downloading => Stage::Extracting,
            Stage::Extracting => Stage::Merging,
            Stage::Merging => Stage::Clustering,
            Stage::Clustering => Stage::PersistingLedger,
            Stage::PersistingLedger => Stage::Reporting,
            Stage::Reporting => Stage::Sleeping,
            Stage::Sleeping => Stage::Downloading,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Downloading => "downloading",
            Stage::Extracting => "extracting",
            Stage::Merging => "merging",
            Stage::Clustering => "clustering",
            Stage::PersistingLedger => "persisting-ledger",
            Stage::Reporting => "reporting",
            Stage::Sleeping => "sleeping",
        };
        write!(f, "{}", name)
    }
}

/// 一个周期的执行结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub downloaded: usize,
    pub extracted: usize,
    pub merged: usize,
    pub clusters: usize,
    pub outliers: usize,
}

pub type SessionFactory = Box<dyn Fn(&FtpConfig) -> Result<Box<dyn RemoteSession>>>;

/// 轮询管道的编排器
///
/// 完全单线程顺序执行，一个周期内下载、提取、合并、聚类、落盘、
/// 报告严格依次完成。同一数据目录同时只允许一个管道实例运行，
/// 多实例并发访问是未定义行为。
pub struct Pipeline {
    config: Config,
    data: DataDir,
    ledger: ProcessedLedger,
    store: FeatureStore,
    connect: SessionFactory,
    extractor: Box<dyn FaceExtractor>,
    clusterer: Box<dyn Clusterer>,
    reporter: Box<dyn Reporter>,
}

impl Pipeline {
    /// 用默认协作者组装管道
    pub fn new(config: Config) -> Result<Self> {
        let extractor = Box::new(CommandExtractor::new(&config.extractor));
        let clusterer = Box::new(Dbscan::from_config(&config.clustering));
        let connect: SessionFactory = Box::new(|ftp| {
            FtpSession::connect(ftp).map(|s| Box::new(s) as Box<dyn RemoteSession>)
        });
        Self::with_collaborators(
            config,
            connect,
            extractor,
            clusterer,
            Box::new(HtmlReporter::default()),
            EMBEDDING_DIM,
        )
    }

    /// 注入自定义协作者，测试用
    pub fn with_collaborators(
        config: Config,
        connect: SessionFactory,
        extractor: Box<dyn FaceExtractor>,
        clusterer: Box<dyn Clusterer>,
        reporter: Box<dyn Reporter>,
        dim: usize,
    ) -> Result<Self> {
        let data = config.data_dir();
        fs::create_dir_all(data.path())?;
        let store = FeatureStore::open(data.features(), data.path_index(), dim)?;
        let ledger = ProcessedLedger::load(data.ledger())?;
        Ok(Self { config, data, ledger, store, connect, extractor, clusterer, reporter })
    }

    /// 永久运行：每个周期之间睡眠轮询间隔，除进程被杀外没有终止条件
    pub fn run(&mut self) {
        let interval = self.config.poll_interval();
        loop {
            let summary = self.run_cycle();
            info!(
                "周期完成: 下载 {} / 提取 {} / 合并 {} / {} 个簇 / {} 个陌生人",
                summary.downloaded,
                summary.extracted,
                summary.merged,
                summary.clusters,
                summary.outliers
            );
            info!("[{}] 等待 {} 秒后开始下一个周期", Stage::Sleeping, interval.as_secs());
            thread::sleep(interval);
        }
    }

    /// 执行一个完整周期
    pub fn run_cycle(&mut self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let mut batch = ExtractBatch::default();
        let mut labels = vec![];

        let mut stage = Stage::Downloading;
        while stage != Stage::Sleeping {
            info!("[{}]", stage);
            let result = match stage {
                Stage::Downloading => self.download(&mut summary),
                Stage::Extracting => {
                    batch = self.extract();
                    summary.extracted = batch.files.len();
                    Ok(())
                }
                Stage::Merging => self.merge(&batch, &mut summary),
                Stage::Clustering => self.cluster(&mut labels, &mut summary),
                Stage::PersistingLedger => self.ledger.persist(self.data.ledger()),
                Stage::Reporting => self.report(&labels),
                Stage::Sleeping => unreachable!(),
            };
            if let Err(e) = result {
                error!("[{}] 阶段出错: {}", stage, e);
            }
            stage = stage.next();
        }
        summary
    }

    fn download(&mut self, summary: &mut CycleSummary) -> Result<()> {
        let session = (self.connect)(&self.config.ftp)?;
        let mut downloader = Downloader::new(
            session,
            self.config.ftp.max_retries,
            Duration::from_secs(self.config.ftp.retry_delay),
        );
        let downloaded = downloader.download_new(
            &self.data.images(),
            &self.config.system.marker,
            &mut self.ledger,
        )?;
        summary.downloaded = downloaded.len();
        // 提前落盘：此后崩溃只损失提取进度，不需要重新下载
        self.ledger.persist(self.data.ledger())?;
        Ok(())
    }

    fn extract(&mut self) -> ExtractBatch {
        extract_new(
            &self.data.images(),
            &self.config.system.marker,
            &mut self.ledger,
            self.extractor.as_ref(),
            self.store.dim(),
        )
    }

    fn merge(&mut self, batch: &ExtractBatch, summary: &mut CycleSummary) -> Result<()> {
        self.store.merge_batch(&batch.vectors, &batch.paths)?;
        // 合并成功后才能算已提取，失败的批次下个周期重新提取
        for file in &batch.files {
            self.ledger.mark(file.clone(), FileState::Extracted);
        }
        summary.merged = batch.vectors.len();
        Ok(())
    }

    fn cluster(&mut self, labels: &mut Vec<i32>, summary: &mut CycleSummary) -> Result<()> {
        let matrix = self.store.load_matrix()?;
        *labels = self.clusterer.cluster(matrix.view());
        save_labels(self.data.labels(), labels)?;

        let mut distinct: Vec<i32> = labels.iter().copied().filter(|&l| l != OUTLIER).collect();
        distinct.sort_unstable();
        distinct.dedup();
        summary.clusters = distinct.len();
        summary.outliers = labels.iter().filter(|&&l| l == OUTLIER).count();
        Ok(())
    }

    fn report(&mut self, labels: &[i32]) -> Result<()> {
        let paths = self.store.paths()?;
        if labels.len() != paths.len() {
            warn!("标签数量 {} 与路径数量 {} 不一致，报告可能不完整", labels.len(), paths.len());
        }
        let html = self.reporter.render(labels, &paths);
        fs::write(self.data.report(), html)?;
        info!("聚类报告已生成: {}", self.data.report().display());
        Ok(())
    }
}
