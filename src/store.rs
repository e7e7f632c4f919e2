use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use ndarray::prelude::*;

use crate::config::DataDir;
use crate::error::{Error, Result};

/// 人脸特征向量的维度
pub const EMBEDDING_DIM: usize = 512;

fn store_write(path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    let path = path.to_path_buf();
    move |source| Error::StoreWrite { path, source }
}

/// 追加式特征库
///
/// 由两个文件组成：定宽的 f32 小端向量日志和逐行的路径索引，
/// 两者必须在任何观察点保持数量一致、顺序对应。两次追加本身
/// 不是原子的，崩溃留下的孤儿半写在下次 `open` 时检测并截断。
pub struct FeatureStore {
    features_path: PathBuf,
    index_path: PathBuf,
    dim: usize,
    count: usize,
}

impl FeatureStore {
    /// 打开或创建特征库并执行启动修复
    ///
    /// 修复顺序：丢弃末尾不完整的向量记录，丢弃末尾没有换行的
    /// 路径行，再把较长的一半截断到较短一半的记录数。
    pub fn open(features_path: PathBuf, index_path: PathBuf, dim: usize) -> Result<Self> {
        if let Some(parent) = features_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut store = Self { features_path, index_path, dim, count: 0 };
        store.repair()?;
        Ok(store)
    }

    /// 按数据目录的默认布局打开
    pub fn open_default(dir: &DataDir) -> Result<Self> {
        Self::open(dir.features(), dir.path_index(), EMBEDDING_DIM)
    }

    fn stride(&self) -> u64 {
        (self.dim * size_of::<f32>()) as u64
    }

    fn repair(&mut self) -> Result<()> {
        let stride = self.stride();

        let mut vector_count = 0;
        if self.features_path.exists() {
            let len = fs::metadata(&self.features_path)?.len();
            if len % stride != 0 {
                let fixed = len - len % stride;
                warn!("特征日志末尾存在不完整记录，截断 {} -> {} 字节", len, fixed);
                truncate(&self.features_path, fixed)?;
            }
            vector_count = (fs::metadata(&self.features_path)?.len() / stride) as usize;
        }

        let mut path_offsets = vec![];
        if self.index_path.exists() {
            let data = fs::read(&self.index_path)?;
            for (i, b) in data.iter().enumerate() {
                if *b == b'\n' {
                    path_offsets.push(i as u64 + 1);
                }
            }
            let terminated = path_offsets.last().copied().unwrap_or(0);
            if terminated < data.len() as u64 {
                warn!("路径索引末尾存在不完整行，截断到 {} 字节", terminated);
                truncate(&self.index_path, terminated)?;
            }
        }
        let path_count = path_offsets.len();

        // 两半数量不一致时，以较短的一半为准
        self.count = vector_count.min(path_count);
        if vector_count > self.count {
            warn!("特征日志比路径索引多 {} 条记录，回滚孤儿写入", vector_count - self.count);
            truncate(&self.features_path, self.count as u64 * stride)?;
        }
        if path_count > self.count {
            warn!("路径索引比特征日志多 {} 行，回滚孤儿写入", path_count - self.count);
            let offset = if self.count == 0 { 0 } else { path_offsets[self.count - 1] };
            truncate(&self.index_path, offset)?;
        }
        Ok(())
    }

    /// 当前库中的记录数
    pub fn count(&self) -> usize {
        self.count
    }

    /// 每条记录的向量维度
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// 将一批向量和对应路径按输入顺序追加入库
    ///
    /// 向量应当已由调用方归一化。任一半写入失败时，两个文件都会
    /// 被截断回调用前的长度，对齐不变量保持不变。
    pub fn merge_batch(&mut self, vectors: &[Array1<f32>], paths: &[String]) -> Result<()> {
        assert_eq!(vectors.len(), paths.len(), "vectors and paths must be aligned");
        if vectors.is_empty() {
            return Ok(());
        }

        let features_len = existing_len(&self.features_path)?;
        let index_len = existing_len(&self.index_path)?;

        if let Err(e) = self.append_all(vectors, paths) {
            // 尽力回滚，保证失败的合并不留下半写
            let _ = truncate(&self.features_path, features_len);
            let _ = truncate(&self.index_path, index_len);
            return Err(e);
        }

        self.count += vectors.len();
        info!("已合并 {} 条特征，库中共 {} 条", vectors.len(), self.count);
        Ok(())
    }

    fn append_all(&self, vectors: &[Array1<f32>], paths: &[String]) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.features_path)
            .map_err(store_write(&self.features_path))?;
        let mut writer = BufWriter::new(file);
        for vector in vectors {
            assert_eq!(vector.len(), self.dim, "unexpected embedding dimension");
            for v in vector {
                writer.write_f32::<LittleEndian>(*v).map_err(store_write(&self.features_path))?;
            }
        }
        writer.flush().map_err(store_write(&self.features_path))?;
        writer
            .into_inner()
            .map_err(|e| Error::StoreWrite {
                path: self.features_path.clone(),
                source: e.into_error(),
            })?
            .sync_data()
            .map_err(store_write(&self.features_path))?;

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.index_path)
            .map_err(store_write(&self.index_path))?;
        let mut writer = BufWriter::new(file);
        for path in paths {
            writeln!(writer, "{}", path).map_err(store_write(&self.index_path))?;
        }
        writer.flush().map_err(store_write(&self.index_path))?;
        writer
            .into_inner()
            .map_err(|e| Error::StoreWrite { path: self.index_path.clone(), source: e.into_error() })?
            .sync_data()
            .map_err(store_write(&self.index_path))?;

        Ok(())
    }

    /// 读取整个向量日志为一个二维数组，供聚类使用
    pub fn load_matrix(&self) -> Result<Array2<f32>> {
        if self.count == 0 {
            return Ok(Array2::zeros((0, self.dim)));
        }
        let mut data = vec![0f32; self.count * self.dim];
        let mut file = File::open(&self.features_path)?;
        file.read_f32_into::<LittleEndian>(&mut data)?;
        Array2::from_shape_vec((self.count, self.dim), data)
            .map_err(|e| Error::Config(format!("特征日志形状错误: {}", e)))
    }

    /// 读取路径索引，与 `load_matrix` 的行一一对应
    pub fn paths(&self) -> Result<Vec<String>> {
        if self.count == 0 {
            return Ok(vec![]);
        }
        let mut text = String::new();
        File::open(&self.index_path)?.read_to_string(&mut text)?;
        Ok(text.lines().take(self.count).map(str::to_string).collect())
    }
}

fn existing_len(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn truncate(path: &Path, len: u64) -> Result<()> {
    if len == 0 && !path.exists() {
        return Ok(());
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(dim: usize, seed: f32) -> Array1<f32> {
        Array1::from_iter((0..dim).map(|i| seed + i as f32))
    }

    fn open_store(dir: &Path, dim: usize) -> FeatureStore {
        FeatureStore::open(dir.join("features.bin"), dir.join("paths.txt"), dim).unwrap()
    }

    #[test]
    fn merge_appends_aligned_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path(), 4);

        store
            .merge_batch(&[embedding(4, 0.0)], &["old.jpg".to_string()])
            .unwrap();
        store
            .merge_batch(
                &[embedding(4, 1.0), embedding(4, 2.0), embedding(4, 3.0)],
                &["p1".to_string(), "p2#face1".to_string(), "p3".to_string()],
            )
            .unwrap();

        assert_eq!(store.count(), 4);
        // 旧内容保留且在新记录之前
        assert_eq!(store.paths().unwrap(), vec!["old.jpg", "p1", "p2#face1", "p3"]);
        let matrix = store.load_matrix().unwrap();
        assert_eq!(matrix.shape(), &[4, 4]);
        assert_eq!(matrix.row(1), embedding(4, 1.0));
        assert_eq!(matrix.row(3), embedding(4, 3.0));
    }

    #[test]
    fn empty_merge_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path(), 4);
        store.merge_batch(&[], &[]).unwrap();
        assert_eq!(store.count(), 0);
        assert!(!dir.path().join("features.bin").exists());
    }

    #[test]
    fn orphan_vector_record_repaired_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open_store(dir.path(), 4);
            store.merge_batch(&[embedding(4, 0.0)], &["a.jpg".to_string()]).unwrap();
        }
        // 模拟向量写入后、路径写入前崩溃
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("features.bin"))
            .unwrap();
        file.write_all(&[0u8; 16]).unwrap();
        drop(file);

        let store = open_store(dir.path(), 4);
        assert_eq!(store.count(), 1);
        assert_eq!(fs::metadata(dir.path().join("features.bin")).unwrap().len(), 16);
    }

    #[test]
    fn partial_trailing_record_and_line_repaired() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open_store(dir.path(), 4);
            store
                .merge_batch(
                    &[embedding(4, 0.0), embedding(4, 1.0)],
                    &["a.jpg".to_string(), "b.jpg".to_string()],
                )
                .unwrap();
        }
        // 半条向量记录 + 没有换行的半行路径
        let mut file =
            OpenOptions::new().append(true).open(dir.path().join("features.bin")).unwrap();
        file.write_all(&[1u8; 7]).unwrap();
        drop(file);
        let mut file = OpenOptions::new().append(true).open(dir.path().join("paths.txt")).unwrap();
        file.write_all(b"half-written").unwrap();
        drop(file);

        let store = open_store(dir.path(), 4);
        assert_eq!(store.count(), 2);
        assert_eq!(store.paths().unwrap(), vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn orphan_path_line_repaired_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open_store(dir.path(), 4);
            store.merge_batch(&[embedding(4, 0.0)], &["a.jpg".to_string()]).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(dir.path().join("paths.txt")).unwrap();
        file.write_all(b"ghost.jpg\n").unwrap();
        drop(file);

        let store = open_store(dir.path(), 4);
        assert_eq!(store.count(), 1);
        assert_eq!(store.paths().unwrap(), vec!["a.jpg"]);
    }

    #[test]
    fn failed_merge_rolls_back_both_halves() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path(), 4);
        store.merge_batch(&[embedding(4, 0.0)], &["a.jpg".to_string()]).unwrap();

        // 把路径索引换成目录，第二次追加在向量写入之后失败
        fs::remove_file(dir.path().join("paths.txt")).unwrap();
        fs::create_dir(dir.path().join("paths.txt")).unwrap();

        let err = store.merge_batch(&[embedding(4, 1.0)], &["b.jpg".to_string()]).unwrap_err();
        assert!(matches!(err, Error::StoreWrite { .. }));

        // 失败的合并不留下半写：向量日志被截断回原长，计数不变
        assert_eq!(store.count(), 1);
        assert_eq!(fs::metadata(dir.path().join("features.bin")).unwrap().len(), 16);
    }

    #[test]
    #[should_panic(expected = "aligned")]
    fn misaligned_batch_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path(), 4);
        let _ = store.merge_batch(&[embedding(4, 0.0)], &[]);
    }
}
