use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// 管道的封闭错误类型
///
/// 每种错误在调用处有各自的处理策略：`Transfer` 在重试次数内重试，
/// `Connection` 中止整个下载批次，`StoreWrite` 和 `Decode` 跳过当前条目，
/// `Config` 仅在启动时致命。
#[derive(Debug, Error)]
pub enum Error {
    /// FTP 会话建立或重连失败
    #[error("connection failed: {0}")]
    Connection(#[source] suppaftp::FtpError),

    /// 单个文件传输中的超时或临时协议错误，可重试
    #[error("transfer failed: {file}: {source}")]
    Transfer {
        file: String,
        #[source]
        source: suppaftp::FtpError,
    },

    /// 续传时本地文件与远程大小不一致，丢弃后从头下载
    #[error("partial file {path} out of sync: local {local} bytes, remote {remote} bytes")]
    PartialFile { path: PathBuf, local: u64, remote: u64 },

    /// 特征库任一半追加写入失败
    #[error("store write failed: {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 图片无法解码，由外部提取器上报
    #[error("cannot decode image: {path}")]
    Decode { path: PathBuf },

    /// 配置缺失或格式错误
    #[error("config error: {0}")]
    Config(String),

    /// 其他本地 IO 错误
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 是否属于传输层的可重试错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transfer { .. })
    }
}
