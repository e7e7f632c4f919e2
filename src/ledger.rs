use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};

use crate::error::Result;

/// 单个文件的处理状态
///
/// 旧版台账只是一个扁平的文件名集合，无法区分“已下载”和“已提取”，
/// 进程在两个阶段之间崩溃时会导致重复下载或重复入库。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// 传输成功，特征尚未提取
    Downloaded,
    /// 特征已提取并入库
    Extracted,
    /// 已确认无人脸或无法解码，不再处理
    Skipped,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileState::Downloaded => write!(f, "downloaded"),
            FileState::Extracted => write!(f, "extracted"),
            FileState::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for FileState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "downloaded" => Ok(FileState::Downloaded),
            "extracted" => Ok(FileState::Extracted),
            "skipped" => Ok(FileState::Skipped),
            _ => Err(()),
        }
    }
}

/// 已处理文件台账
///
/// 运行期间只增不减；每行 `文件名\t状态`，没有制表符的行按旧版
/// 扁平格式处理，视为已提取。
#[derive(Debug, Default)]
pub struct ProcessedLedger {
    entries: HashMap<String, FileState>,
}

impl ProcessedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从文件加载台账，文件不存在时返回空台账
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let mut entries = HashMap::new();
        for line in fs::read_to_string(path)?.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('\t') {
                Some((name, state)) => match state.parse() {
                    Ok(state) => {
                        entries.insert(name.to_string(), state);
                    }
                    Err(()) => warn!("台账中存在未知状态，忽略该行: {}", line),
                },
                // 旧版扁平格式
                None => {
                    entries.insert(line.to_string(), FileState::Extracted);
                }
            }
        }
        info!("已加载台账: {} 个条目", entries.len());
        Ok(Self { entries })
    }

    /// 将台账整体写回文件
    ///
    /// 先写临时文件再原子改名，避免崩溃留下半个台账。
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("txt.tmp");
        let mut file = fs::File::create(&tmp)?;
        for (name, state) in &self.entries {
            writeln!(file, "{}\t{}", name, state)?;
        }
        file.sync_data()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// 文件名是否已经出现过（任意状态），用于过滤下载候选
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// 是否还需要提取特征：未见过或只下载了的文件
    pub fn needs_extraction(&self, name: &str) -> bool {
        !matches!(self.entries.get(name), Some(FileState::Extracted) | Some(FileState::Skipped))
    }

    pub fn mark(&mut self, name: impl Into<String>, state: FileState) {
        self.entries.insert(name.into(), state);
    }

    pub fn state(&self, name: &str) -> Option<FileState> {
        self.entries.get(name).copied()
    }

    pub fn filenames(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
