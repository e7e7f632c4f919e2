use std::collections::VecDeque;
use std::path::Path;

use log::info;
use ndarray::prelude::*;
use ndarray_npy::{read_npy, write_npy};

use crate::config::{ClusteringConfig, Metric};
use crate::error::{Error, Result};

/// 离群点的标签
pub const OUTLIER: i32 = -1;

/// 聚类器，外部协作者的接口
///
/// 输入单位向量矩阵，输出与行对齐的整数标签，-1 表示不属于任何
/// 稠密簇的离群点。每个周期对整库全量重跑，不做增量聚类。
pub trait Clusterer {
    fn cluster(&self, features: ArrayView2<f32>) -> Vec<i32>;
}

/// 朴素的 DBSCAN 实现，O(n²) 邻域查询
pub struct Dbscan {
    pub eps: f32,
    pub min_samples: usize,
    pub metric: Metric,
}

impl Dbscan {
    pub fn from_config(config: &ClusteringConfig) -> Self {
        Self { eps: config.eps, min_samples: config.min_samples, metric: config.metric }
    }

    fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
        match self.metric {
            // 单位向量之间的余弦距离
            Metric::Cosine => 1.0 - a.dot(&b),
            Metric::Euclidean => {
                let diff = &a - &b;
                diff.dot(&diff).sqrt()
            }
        }
    }

    /// eps 邻域内的点，包含点本身
    fn region_query(&self, x: ArrayView2<f32>, i: usize) -> Vec<usize> {
        (0..x.nrows()).filter(|&j| self.distance(x.row(i), x.row(j)) <= self.eps).collect()
    }
}

const UNVISITED: i32 = i32::MIN;

impl Clusterer for Dbscan {
    fn cluster(&self, x: ArrayView2<f32>) -> Vec<i32> {
        let n = x.nrows();
        let mut labels = vec![UNVISITED; n];
        let mut cluster = 0;

        for i in 0..n {
            if labels[i] != UNVISITED {
                continue;
            }
            let neighbors = self.region_query(x, i);
            if neighbors.len() < self.min_samples {
                labels[i] = OUTLIER;
                continue;
            }

            labels[i] = cluster;
            let mut queue = VecDeque::from(neighbors);
            while let Some(j) = queue.pop_front() {
                if labels[j] == OUTLIER {
                    // 边界点，归入当前簇但不再扩张
                    labels[j] = cluster;
                }
                if labels[j] != UNVISITED {
                    continue;
                }
                labels[j] = cluster;
                let neighbors = self.region_query(x, j);
                if neighbors.len() >= self.min_samples {
                    queue.extend(neighbors);
                }
            }
            cluster += 1;
        }

        let noise = labels.iter().filter(|&&l| l == OUTLIER).count();
        info!("共聚类出 {} 个簇，{} 个被识别为陌生人", cluster, noise);
        labels
    }
}

/// 将标签按库内顺序保存为 npy 文件
pub fn save_labels(path: impl AsRef<Path>, labels: &[i32]) -> Result<()> {
    let path = path.as_ref();
    write_npy(path, &Array1::from(labels.to_vec())).map_err(|e| Error::StoreWrite {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    info!("聚类标签已保存，数量: {}", labels.len());
    Ok(())
}

/// 从 npy 文件读回标签
pub fn load_labels(path: impl AsRef<Path>) -> Result<Vec<i32>> {
    let path = path.as_ref();
    let labels: Array1<i32> = read_npy(path).map_err(|e| {
        Error::Io(std::io::Error::other(format!("cannot read labels {}: {}", path.display(), e)))
    })?;
    Ok(labels.to_vec())
}
