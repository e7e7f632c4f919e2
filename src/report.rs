use std::collections::BTreeMap;
use std::path::Path;

use crate::cluster::OUTLIER;

/// 报告渲染器，外部协作者的接口
///
/// 标签数组与路径索引按下标对齐，输出自包含的 HTML 文档。
pub trait Reporter {
    fn render(&self, labels: &[i32], paths: &[String]) -> String;
}

/// 按簇分组的静态 HTML 报告
///
/// 路径中的 `#faceN` 后缀只用于区分同图多脸，展示缩略图时去掉；
/// 离群点（-1）单独成组并以“陌生人”标注。
pub struct HtmlReporter {
    /// 是否只展示本地存在的图片
    pub check_files: bool,
}

impl Default for HtmlReporter {
    fn default() -> Self {
        Self { check_files: true }
    }
}

/// 路径来自文件系统而非可信输入，进入标记前转义特殊字符
fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&#39;")
        .replace('"', "&quot;")
}

impl Reporter for HtmlReporter {
    fn render(&self, labels: &[i32], paths: &[String]) -> String {
        let mut clusters: BTreeMap<i32, Vec<&str>> = BTreeMap::new();
        for (path, label) in paths.iter().zip(labels) {
            clusters.entry(*label).or_default().push(path);
        }
        let n_clusters = clusters.keys().filter(|&&l| l != OUTLIER).count();
        let n_noise = clusters.get(&OUTLIER).map_or(0, |v| v.len());

        let mut html = vec![];
        html.push("<html><head><meta charset='utf-8'><title>人脸聚类报告</title>".to_string());
        html.push("<style>".to_string());
        html.push("body { font-family: Arial, sans-serif; }".to_string());
        html.push(".cluster { margin-bottom: 40px; }".to_string());
        html.push(".cluster-title { font-size: 20px; margin-bottom: 10px; }".to_string());
        html.push(".thumb { margin: 5px; border: 1px solid #ccc; display: inline-block; }".to_string());
        html.push(
            ".thumb img { display: block; width: 112px; height: 112px; object-fit: cover; }"
                .to_string(),
        );
        html.push(
            ".thumb-caption { font-size: 10px; text-align: center; width: 112px; word-break: break-word; }"
                .to_string(),
        );
        html.push("</style></head><body>".to_string());
        html.push("<h1>人脸聚类报告</h1>".to_string());
        html.push(format!("<p>共聚类出 {} 个簇，陌生人（噪声点）数量：{}</p>", n_clusters, n_noise));

        for (label, members) in &clusters {
            let title = match *label {
                OUTLIER => "陌生人 (-1)".to_string(),
                label => format!("聚类 {}", label),
            };
            html.push("<div class='cluster'>".to_string());
            html.push(format!(
                "<div class='cluster-title'>{} - 共 {} 张图片</div>",
                title,
                members.len()
            ));
            for member in members {
                let img_path = member.split('#').next().unwrap_or(member);
                if self.check_files && !Path::new(img_path).exists() {
                    continue;
                }
                let caption = Path::new(member)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| member.to_string());
                let caption = escape_html(&caption);
                html.push("<div class='thumb'>".to_string());
                html.push(format!(
                    "<img src='file:///{}' alt='{}' style='width:112px;height:112px;object-fit:cover;'/>",
                    escape_html(img_path),
                    caption
                ));
                html.push(format!("<div class='thumb-caption'>{}</div>", caption));
                html.push("</div>".to_string());
            }
            html.push("</div>".to_string());
        }

        html.push("</body></html>".to_string());
        html.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> HtmlReporter {
        HtmlReporter { check_files: false }
    }

    #[test]
    fn groups_paths_by_label() {
        let labels = vec![-1, 0, 0, 1];
        let paths = vec![
            "/img/x_FACE_SNAP.jpg".to_string(),
            "/img/a_FACE_SNAP.jpg".to_string(),
            "/img/b_FACE_SNAP.jpg#face1".to_string(),
            "/img/c_FACE_SNAP.jpg".to_string(),
        ];
        let html = reporter().render(&labels, &paths);

        assert!(html.contains("共聚类出 2 个簇，陌生人（噪声点）数量：1"));
        assert!(html.contains("陌生人 (-1) - 共 1 张图片"));
        assert!(html.contains("聚类 0 - 共 2 张图片"));
        assert!(html.contains("聚类 1 - 共 1 张图片"));
        // 缩略图地址去掉 #face 后缀，标题保留
        assert!(html.contains("src='file:////img/b_FACE_SNAP.jpg'"));
        assert!(html.contains("<div class='thumb-caption'>b_FACE_SNAP.jpg#face1</div>"));
    }

    #[test]
    fn quotes_in_paths_are_escaped() {
        let labels = vec![0];
        let paths = vec!["/img/o'brien_FACE_SNAP.jpg".to_string()];
        let html = reporter().render(&labels, &paths);

        assert!(!html.contains("o'brien"));
        assert!(html.contains("o&#39;brien_FACE_SNAP.jpg"));
    }

    #[test]
    fn empty_store_renders_empty_report() {
        let html = reporter().render(&[], &[]);
        assert!(html.contains("共聚类出 0 个簇，陌生人（噪声点）数量：0"));
        assert!(html.starts_with("<html>"));
        assert!(html.ends_with("</body></html>"));
    }
}
