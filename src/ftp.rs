use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::net::ToSocketAddrs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};

use crate::config::FtpConfig;
use crate::error::{Error, Result};
use crate::ledger::{FileState, ProcessedLedger};

/// 流式读取的块大小
const BLOCK_SIZE: usize = 32 * 1024;

/// 一条远程会话，抽象出下载器依赖的五个协议操作
///
/// 生产实现是 [`FtpSession`]，测试里用脚本化的假会话模拟网络故障。
pub trait RemoteSession {
    /// 列出工作目录下的所有文件名
    fn list(&mut self) -> Result<Vec<String>>;
    /// 查询远程文件大小
    fn size(&mut self, name: &str) -> Result<u64>;
    /// 从指定偏移开始取回文件内容，返回写入 sink 的字节数
    fn retrieve(&mut self, name: &str, offset: u64, sink: &mut dyn Write) -> Result<u64>;
    /// 断开旧连接并用相同凭据重建会话
    fn reconnect(&mut self) -> Result<()>;
}

impl<S: RemoteSession + ?Sized> RemoteSession for Box<S> {
    fn list(&mut self) -> Result<Vec<String>> {
        (**self).list()
    }

    fn size(&mut self, name: &str) -> Result<u64> {
        (**self).size(name)
    }

    fn retrieve(&mut self, name: &str, offset: u64, sink: &mut dyn Write) -> Result<u64> {
        (**self).retrieve(name, offset, sink)
    }

    fn reconnect(&mut self) -> Result<()> {
        (**self).reconnect()
    }
}

/// 基于 suppaftp 的 FTP 会话，被动模式 + 二进制传输
pub struct FtpSession {
    stream: FtpStream,
    config: FtpConfig,
}

impl std::fmt::Debug for FtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FtpSession {
    /// 建立会话：连接、登录、被动模式、二进制类型、切换工作目录
    pub fn connect(config: &FtpConfig) -> Result<Self> {
        let stream = Self::open_stream(config)?;
        info!("成功连接到 FTP 服务器: {}", config.host);
        Ok(Self { stream, config: config.clone() })
    }

    fn open_stream(config: &FtpConfig) -> Result<FtpStream> {
        let timeout = Duration::from_secs(config.timeout_sec);
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection(FtpError::ConnectionError(e)))?
            .next()
            .ok_or_else(|| {
                Error::Connection(FtpError::ConnectionError(std::io::Error::other(
                    "no address resolved",
                )))
            })?;

        let mut stream =
            FtpStream::connect_timeout(addr, timeout).map_err(Error::Connection)?;
        stream
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::Connection(FtpError::ConnectionError(e)))?;
        stream.login(&config.user, &config.password).map_err(Error::Connection)?;
        stream.set_mode(Mode::Passive);
        stream.transfer_type(FileType::Binary).map_err(Error::Connection)?;
        stream.cwd(&config.remote_dir).map_err(Error::Connection)?;
        Ok(stream)
    }

}

fn transfer_error(name: &str) -> impl FnOnce(FtpError) -> Error {
    let file = name.to_string();
    move |e| Error::Transfer { file, source: e }
}

impl RemoteSession for FtpSession {
    fn list(&mut self) -> Result<Vec<String>> {
        self.stream.nlst(None).map_err(Error::Connection)
    }

    fn size(&mut self, name: &str) -> Result<u64> {
        self.stream.size(name).map(|n| n as u64).map_err(transfer_error(name))
    }

    fn retrieve(&mut self, name: &str, offset: u64, sink: &mut dyn Write) -> Result<u64> {
        if offset > 0 {
            self.stream.resume_transfer(offset as usize).map_err(transfer_error(name))?;
        }
        let mut data = self.stream.retr_as_stream(name).map_err(transfer_error(name))?;
        // 数据连接同样受读超时约束，停滞的 RETR 按超时错误处理
        data.get_ref()
            .set_read_timeout(Some(Duration::from_secs(self.config.timeout_sec)))
            .map_err(|e| transfer_error(name)(FtpError::ConnectionError(e)))?;

        let mut buf = [0u8; BLOCK_SIZE];
        let mut written = 0u64;
        loop {
            let n = data
                .read(&mut buf)
                .map_err(|e| transfer_error(name)(FtpError::ConnectionError(e)))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            written += n as u64;
        }

        self.stream.finalize_retr_stream(data).map_err(transfer_error(name))?;
        Ok(written)
    }

    fn reconnect(&mut self) -> Result<()> {
        let _ = self.stream.quit();
        self.stream = Self::open_stream(&self.config)?;
        info!("FTP 连接已重新建立");
        Ok(())
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        let _ = self.stream.quit();
    }
}

/// 带重试和断点续传的下载器
pub struct Downloader<S> {
    session: S,
    max_retries: u32,
    retry_delay: Duration,
}

impl<S: RemoteSession> Downloader<S> {
    pub fn new(session: S, max_retries: u32, retry_delay: Duration) -> Self {
        Self { session, max_retries, retry_delay }
    }

    /// 列出包含数据集标记且台账中未出现过的远程文件，没有匹配时返回空列表
    pub fn list_candidates(
        &mut self,
        marker: &str,
        ledger: &ProcessedLedger,
    ) -> Result<Vec<String>> {
        let names = self.session.list()?;
        Ok(names
            .into_iter()
            .filter(|name| name.contains(marker) && !ledger.contains(name))
            .collect())
    }

    /// 下载一批新文件
    ///
    /// 单个文件失败只记录日志并跳过，不会中断整批；列目录失败
    /// （会话级错误）向上传播，由编排器捕获。每个下载成功的文件
    /// 在台账中标记为已下载。
    pub fn download_new(
        &mut self,
        local_dir: &Path,
        marker: &str,
        ledger: &mut ProcessedLedger,
    ) -> Result<Vec<String>> {
        let candidates = self.list_candidates(marker, ledger)?;
        info!("发现 {} 个新文件需要下载", candidates.len());
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        fs::create_dir_all(local_dir)?;

        let total = candidates.len();
        let mut downloaded = vec![];
        for name in candidates {
            let local_path = local_dir.join(&name);
            if self.download_with_retry(&name, &local_path) {
                ledger.mark(name.clone(), FileState::Downloaded);
                info!("成功下载: {}", name);
                downloaded.push(name);
            } else {
                error!("下载失败: {}", name);
            }
        }
        info!("下载完成: {}/{} 个文件成功下载", downloaded.len(), total);
        Ok(downloaded)
    }

    /// 下载单个文件，支持断点续传，失败时在重试次数内重试
    ///
    /// 重试耗尽或遇到不可重试错误时删除本地残留文件并返回 false。
    pub fn download_with_retry(&mut self, name: &str, local_path: &Path) -> bool {
        let mut offset = self.resume_offset(name, local_path);

        let mut attempts = 0;
        while attempts < self.max_retries {
            attempts += 1;
            match self.transfer_once(name, local_path, offset) {
                Ok(()) => {
                    self.verify_size(name, local_path);
                    return true;
                }
                Err(e) if e.is_transient() => {
                    warn!("下载错误 (尝试 {}/{}): {}", attempts, self.max_retries, e);
                    offset = existing_size(local_path);
                    if attempts < self.max_retries {
                        info!("等待 {} 秒后重试...", self.retry_delay.as_secs());
                        thread::sleep(self.retry_delay);
                        // 重连是尽力而为的，失败只消耗一次尝试
                        if let Err(e) = self.session.reconnect() {
                            error!("重新连接失败: {}", e);
                        }
                    }
                }
                Err(e) => {
                    error!("下载失败: {}: {}", name, e);
                    break;
                }
            }
        }

        if local_path.exists() {
            match fs::remove_file(local_path) {
                Ok(()) => info!("已删除不完整文件: {}", local_path.display()),
                Err(e) => warn!("删除不完整文件失败: {}: {}", local_path.display(), e),
            }
        }
        false
    }

    /// 计算续传偏移
    ///
    /// 本地文件不小于远程大小、或查询远程大小失败时，丢弃本地
    /// 文件从头开始。
    fn resume_offset(&mut self, name: &str, local_path: &Path) -> u64 {
        let local = existing_size(local_path);
        if local == 0 {
            return 0;
        }
        let result = match self.session.size(name) {
            Ok(remote) if local < remote => Ok(local),
            Ok(remote) => Err(Error::PartialFile { path: local_path.to_path_buf(), local, remote }),
            Err(e) => Err(e),
        };
        match result {
            Ok(offset) => {
                info!("尝试续传: {} (已下载 {} 字节)", name, offset);
                offset
            }
            Err(e @ Error::PartialFile { .. }) => {
                warn!("{}，删除后重新下载", e);
                let _ = fs::remove_file(local_path);
                0
            }
            Err(e) => {
                warn!("无法获取远程文件大小 ({})，删除本地文件: {}", e, local_path.display());
                let _ = fs::remove_file(local_path);
                0
            }
        }
    }

    fn transfer_once(&mut self, name: &str, local_path: &Path, offset: u64) -> Result<()> {
        let file = if offset > 0 {
            OpenOptions::new().append(true).open(local_path)?
        } else {
            OpenOptions::new().write(true).create(true).truncate(true).open(local_path)?
        };
        let mut writer = BufWriter::new(file);
        self.session.retrieve(name, offset, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// 成功后尽力验证大小，不一致只记录日志，不视为失败
    fn verify_size(&mut self, name: &str, local_path: &Path) {
        let local = existing_size(local_path);
        if let Ok(remote) = self.session.size(name) {
            if remote != local {
                warn!("文件大小不匹配: {}: 本地 {} != 远程 {}", name, local, remote);
            }
        }
    }
}

fn existing_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
