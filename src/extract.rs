use std::path::{Path, PathBuf};
use std::process::Command;

use log::{error, info, warn};
use ndarray::prelude::*;
use walkdir::WalkDir;

use crate::config::ExtractorConfig;
use crate::error::{Error, Result};
use crate::ledger::{FileState, ProcessedLedger};

/// 人脸特征提取器
///
/// 模型本身是外部协作者：输入一张图片，输出零个或多个定维向量，
/// 每个向量对应一张检测到的人脸。无法解码的图片返回 [`Error::Decode`]。
pub trait FaceExtractor {
    fn extract(&self, image: &Path) -> Result<Vec<Array1<f32>>>;
}

/// 调用外部提取器进程的实现
///
/// 提取器程序接受图片路径作为唯一参数，在标准输出上每行打印一个
/// 逗号分隔的向量；没有检测到人脸时不输出任何行；退出码 2 表示
/// 图片无法解码。
pub struct CommandExtractor {
    command: PathBuf,
}

impl CommandExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self { command: config.command() }
    }
}

impl FaceExtractor for CommandExtractor {
    fn extract(&self, image: &Path) -> Result<Vec<Array1<f32>>> {
        let output = Command::new(&self.command).arg(image).output()?;
        if output.status.code() == Some(2) {
            return Err(Error::Decode { path: image.to_path_buf() });
        }
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "extractor exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut faces = vec![];
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let values = line
                .split(',')
                .map(|v| v.trim().parse::<f32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| std::io::Error::other(format!("bad embedding line: {}", e)))?;
            faces.push(Array1::from(values));
        }
        Ok(faces)
    }
}

/// 一批待合并的提取结果
///
/// `files` 中的文件名在合并成功后才标记为已提取，避免合并失败时
/// 台账与特征库脱节。
#[derive(Debug, Default)]
pub struct ExtractBatch {
    pub vectors: Vec<Array1<f32>>,
    pub paths: Vec<String>,
    pub files: Vec<String>,
}

impl ExtractBatch {
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty() && self.files.is_empty()
    }
}

/// 扫描图片目录并对新文件做增量特征提取
///
/// 只处理带数据集标记的 png/jpg/jpeg 文件；已提取或已跳过的文件
/// 不再处理。无人脸和解码失败都标记为跳过；其他错误不标记，
/// 留待下个周期重试。向量在此归一化为单位长度，一张图多张脸时
/// 路径加 `#faceN` 后缀。
pub fn extract_new(
    image_dir: &Path,
    marker: &str,
    ledger: &mut ProcessedLedger,
    extractor: &dyn FaceExtractor,
    dim: usize,
) -> ExtractBatch {
    let mut entries: Vec<PathBuf> = WalkDir::new(image_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_candidate(path, marker))
        .collect();
    entries.sort();

    let mut batch = ExtractBatch::default();
    for path in entries {
        let Some(fname) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !ledger.needs_extraction(&fname) {
            continue;
        }

        let faces = match extractor.extract(&path) {
            Ok(faces) => faces,
            Err(e @ Error::Decode { .. }) => {
                warn!("{}，跳过该图片", e);
                ledger.mark(fname, FileState::Skipped);
                continue;
            }
            Err(e) => {
                error!("处理 {} 时出错: {}", path.display(), e);
                continue;
            }
        };

        if faces.is_empty() {
            info!("未在 {} 中检测到人脸", path.display());
            ledger.mark(fname, FileState::Skipped);
            continue;
        }

        let multiple = faces.len() > 1;
        for (j, face) in faces.into_iter().enumerate() {
            if face.len() != dim {
                warn!("{} 的第 {} 个向量维度为 {}，期望 {}，忽略", path.display(), j, face.len(), dim);
                continue;
            }
            let Some(face) = normalize(face) else {
                warn!("{} 的第 {} 个向量为零向量，忽略", path.display(), j);
                continue;
            };
            let face_path = match multiple {
                true => format!("{}#face{}", path.display(), j),
                false => path.display().to_string(),
            };
            batch.vectors.push(face);
            batch.paths.push(face_path);
        }
        batch.files.push(fname);
    }

    info!("提取完成: {} 个文件, {} 张人脸", batch.files.len(), batch.vectors.len());
    batch
}

fn is_candidate(path: &Path, marker: &str) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if !name.contains(marker) {
        return false;
    }
    matches!(
        path.extension().map(|e| e.to_ascii_lowercase()),
        Some(ext) if ext == "png" || ext == "jpg" || ext == "jpeg"
    )
}

/// 归一化为单位向量，零向量返回 None
fn normalize(v: Array1<f32>) -> Option<Array1<f32>> {
    let norm = v.dot(&v).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(v / norm)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use super::*;

    struct FakeExtractor {
        faces: HashMap<String, Vec<Array1<f32>>>,
        decode_failures: Vec<String>,
    }

    impl FaceExtractor for FakeExtractor {
        fn extract(&self, image: &Path) -> Result<Vec<Array1<f32>>> {
            let name = image.file_name().unwrap().to_string_lossy().to_string();
            if self.decode_failures.contains(&name) {
                return Err(Error::Decode { path: image.to_path_buf() });
            }
            Ok(self.faces.get(&name).cloned().unwrap_or_default())
        }
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"jpeg").unwrap();
    }

    #[test]
    fn incremental_extraction() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a_FACE_SNAP.jpg");
        touch(dir.path(), "b_FACE_SNAP.jpg");
        touch(dir.path(), "c_FACE_SNAP.jpg");
        touch(dir.path(), "d_FACE_SNAP.jpg");
        touch(dir.path(), "notes.txt");
        touch(dir.path(), "plain.jpg");

        let extractor = FakeExtractor {
            faces: HashMap::from([
                ("a_FACE_SNAP.jpg".to_string(), vec![array![2.0, 0.0]]),
                (
                    "b_FACE_SNAP.jpg".to_string(),
                    vec![array![0.0, 3.0], array![1.0, 0.0]],
                ),
                // c: 无人脸
            ]),
            decode_failures: vec!["d_FACE_SNAP.jpg".to_string()],
        };

        let mut ledger = ProcessedLedger::new();
        let batch = extract_new(dir.path(), "_FACE_SNAP", &mut ledger, &extractor, 2);

        // a 一张脸，b 两张脸带后缀，顺序按文件名排序
        assert_eq!(batch.vectors.len(), 3);
        assert_eq!(batch.paths.len(), 3);
        assert!(batch.paths[0].ends_with("a_FACE_SNAP.jpg"));
        assert!(batch.paths[1].ends_with("b_FACE_SNAP.jpg#face0"));
        assert!(batch.paths[2].ends_with("b_FACE_SNAP.jpg#face1"));
        assert_eq!(batch.files, vec!["a_FACE_SNAP.jpg", "b_FACE_SNAP.jpg"]);

        // 向量已归一化
        assert_eq!(batch.vectors[0], array![1.0, 0.0]);
        assert_eq!(batch.vectors[1], array![0.0, 1.0]);

        // 无人脸和解码失败都标记为跳过，提取成功的由调用方标记
        assert_eq!(ledger.state("c_FACE_SNAP.jpg"), Some(FileState::Skipped));
        assert_eq!(ledger.state("d_FACE_SNAP.jpg"), Some(FileState::Skipped));
        assert_eq!(ledger.state("a_FACE_SNAP.jpg"), None);
        assert!(!ledger.contains("notes.txt"));
        assert!(!ledger.contains("plain.jpg"));
    }

    #[test]
    fn already_extracted_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a_FACE_SNAP.jpg");

        let extractor = FakeExtractor {
            faces: HashMap::from([("a_FACE_SNAP.jpg".to_string(), vec![array![1.0, 0.0]])]),
            decode_failures: vec![],
        };

        let mut ledger = ProcessedLedger::new();
        ledger.mark("a_FACE_SNAP.jpg", FileState::Extracted);
        let batch = extract_new(dir.path(), "_FACE_SNAP", &mut ledger, &extractor, 2);
        assert!(batch.is_empty());
    }

    #[test]
    fn wrong_dimension_vector_ignored() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a_FACE_SNAP.jpg");

        let extractor = FakeExtractor {
            faces: HashMap::from([("a_FACE_SNAP.jpg".to_string(), vec![array![1.0, 0.0, 0.0]])]),
            decode_failures: vec![],
        };

        let mut ledger = ProcessedLedger::new();
        let batch = extract_new(dir.path(), "_FACE_SNAP", &mut ledger, &extractor, 2);
        assert!(batch.vectors.is_empty());
        // 文件本身算处理过，空批次不会产生孤儿路径
        assert_eq!(batch.files, vec!["a_FACE_SNAP.jpg"]);
    }

    #[cfg(unix)]
    #[test]
    fn command_extractor_parses_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("extract-faces");
        fs::write(&script, "#!/bin/sh\necho '1.0, 0.0, 0.0'\necho '0.0, 1.0, 0.0'\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let extractor = CommandExtractor {
            command: script,
        };
        let faces = extractor.extract(Path::new("ignored.jpg")).unwrap();
        assert_eq!(faces, vec![array![1.0, 0.0, 0.0], array![0.0, 1.0, 0.0]]);
    }

    #[cfg(unix)]
    #[test]
    fn command_extractor_exit_2_is_decode_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("extract-faces");
        fs::write(&script, "#!/bin/sh\nexit 2\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let extractor = CommandExtractor {
            command: script,
        };
        let err = extractor.extract(Path::new("broken.jpg")).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
