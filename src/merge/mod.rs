// 合并引擎：资源重映射 -> 正文改写 -> 文档组装

pub mod assembler;
pub mod composer;
pub mod remapper;


use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::parser::{ParseDegradation, ParseQuality, ParsedDocument};

pub use assembler::assemble;
pub use composer::compose;
pub use remapper::{remap, IdMapping, ResourceTable};

/// 单个源文档在合并中的情况
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    /// 提交顺序，从 0 开始
    pub index: usize,
    pub title: String,
    pub quality: ParseQuality,
    /// 贡献的图片数量
    pub resources: usize,
    pub degradations: Vec<ParseDegradation>,
    /// 上传时的文件名，由会话层补上
    pub file_name: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// 合并报告，交给传输层展示
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub title: String,
    pub sources: Vec<SourceSummary>,
    pub resources: usize,
}

impl MergeReport {
    /// 有部分内容没能恢复的源文档
    pub fn degraded_sources(&self) -> impl Iterator<Item = &SourceSummary> {
        self.sources
            .iter()
            .filter(|s| s.quality == ParseQuality::Degraded)
    }

    /// 按提交顺序附上每个源文档的上传信息
    pub fn attach_uploads<I>(&mut self, uploads: I)
    where
        I: IntoIterator<Item = (String, DateTime<Utc>)>,
    {
        for (summary, (name, at)) in self.sources.iter_mut().zip(uploads) {
            summary.file_name = Some(name);
            summary.submitted_at = Some(at);
        }
    }
}

/// 合并中的书
#[derive(Debug, Clone)]
pub struct MergedBook {
    /// 书名（纯文本，不含扩展名）
    pub title: String,
    /// 按提交顺序排列的正文片段
    pub bodies: Vec<String>,
    /// 全局 ID -> 图片
    pub resources: ResourceTable,
    /// 源文档根元素上声明的命名空间前缀
    pub namespaces: Vec<(String, String)>,
    sources: Vec<SourceSummary>,
}

impl MergedBook {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            bodies: Vec::new(),
            resources: ResourceTable::new(),
            namespaces: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// 追加一个已解析的文档
    ///
    /// 先为它的图片分配全局 ID，再只用它自己的映射改写它的正文
    pub fn append(&mut self, doc: ParsedDocument) -> &SourceSummary {
        let quality = doc.quality();
        let mapping = remap(doc.resources, &mut self.resources);
        self.bodies.push(compose(&doc.body, &mapping));

        for (prefix, uri) in doc.namespaces {
            if !self.namespaces.iter().any(|(p, _)| *p == prefix) {
                self.namespaces.push((prefix, uri));
            }
        }

        let index = self.sources.len();
        self.sources.push(SourceSummary {
            index,
            title: doc.title,
            quality,
            resources: mapping.len(),
            degradations: doc.degradations,
            file_name: None,
            submitted_at: None,
        });
        &self.sources[index]
    }

    pub fn report(&self) -> MergeReport {
        MergeReport {
            title: self.title.clone(),
            sources: self.sources.clone(),
            resources: self.resources.len(),
        }
    }

    /// 序列化为 FB2 文本
    pub fn to_xml(&self) -> String {
        assemble(self)
    }
}

/// 按顺序合并多个已解析的文档
///
/// # 参数
/// - `title`: 输出书名（纯文本）
/// - `documents`: 按提交顺序排列的文档
pub fn merge_documents<I>(title: &str, documents: I) -> MergedBook
where
    I: IntoIterator<Item = ParsedDocument>,
{
    let mut book = MergedBook::new(title);
    for doc in documents {
        let summary = book.append(doc);
        if summary.quality == ParseQuality::Degraded {
            tracing::warn!(
                index = summary.index,
                title = %summary.title,
                problems = summary.degradations.len(),
                "source document only partially recovered"
            );
        }
    }
    book
}
