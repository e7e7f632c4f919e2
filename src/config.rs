use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::cli::*;
use crate::error::{Error, Result};

#[derive(Parser, Debug, Clone)]
#[command(name = "facesnap", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 配置文件路径
    #[arg(short, long, default_value = "facesnap.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 以守护进程方式运行轮询管道
    Run(RunCommand),
    /// 只执行一个下载批次
    Fetch(FetchCommand),
    /// 对特征库全量重新聚类并生成报告
    Cluster(ClusterCommand),
    /// 查看特征库和台账的状态
    Status(StatusCommand),
    /// 用现有标签重新渲染报告
    Report(ReportCommand),
}

/// 完整的运行配置，从 TOML 文件读取
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub ftp: FtpConfig,
    pub system: SystemConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    pub extractor: ExtractorConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub remote_dir: String,
    /// 连接与读取超时（秒）
    #[serde(default = "default_timeout")]
    pub timeout_sec: u64,
    /// 单个文件的最大尝试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试前的等待时间（秒）
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// 所有本地文件所在的数据目录
    pub data_dir: PathBuf,
    /// 轮询间隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// 文件名必须包含的数据集标记
    #[serde(default = "default_marker")]
    pub marker: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClusteringConfig {
    pub eps: f32,
    pub min_samples: usize,
    pub metric: Metric,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self { eps: 0.5, min_samples: 2, metric: Metric::Cosine }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    Euclidean,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExtractorConfig {
    /// 提取器程序名，相对于 model_root
    pub model_name: String,
    pub model_root: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub num_workers: usize,
}

fn default_port() -> u16 {
    21
}
fn default_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    10
}
fn default_marker() -> String {
    "_FACE_SNAP".to_string()
}
fn default_batch_size() -> usize {
    8
}

impl Config {
    /// 读取并校验配置文件，任何错误在启动时都是致命的
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config =
            toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ftp.host.is_empty() {
            return Err(Error::Config("ftp.host 不能为空".to_string()));
        }
        if self.ftp.max_retries == 0 {
            return Err(Error::Config("ftp.max_retries 必须大于 0".to_string()));
        }
        if self.clustering.eps <= 0.0 {
            return Err(Error::Config("clustering.eps 必须大于 0".to_string()));
        }
        if self.clustering.min_samples == 0 {
            return Err(Error::Config("clustering.min_samples 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> DataDir {
        DataDir { path: self.system.data_dir.clone() }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.system.poll_interval)
    }
}

impl ExtractorConfig {
    /// 提取器可执行文件的完整路径
    pub fn command(&self) -> PathBuf {
        self.model_root.join(&self.model_name)
    }
}

/// 数据目录，负责推导各个文件的路径
#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回下载图片所在的目录
    pub fn images(&self) -> PathBuf {
        self.path.join("images")
    }

    /// 返回特征向量日志的路径
    pub fn features(&self) -> PathBuf {
        self.path.join("features.bin")
    }

    /// 返回路径索引文件的路径
    pub fn path_index(&self) -> PathBuf {
        self.path.join("paths.txt")
    }

    /// 返回聚类标签文件的路径
    pub fn labels(&self) -> PathBuf {
        self.path.join("labels.npy")
    }

    /// 返回处理台账文件的路径
    pub fn ledger(&self) -> PathBuf {
        self.path.join("processed.txt")
    }

    /// 返回 HTML 报告的路径
    pub fn report(&self) -> PathBuf {
        self.path.join("report.html")
    }
}
