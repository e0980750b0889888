use serde::Serialize;
use std::path::Path;

// 子模块声明
pub mod encoding;
pub mod fb2_parser;

pub use fb2_parser::Fb2Parser;

/// 图片资源的媒体类型前缀
pub const IMAGE_MIME_PREFIX: &str = "image/";

/// 嵌入的二进制资源
///
/// 只保留图片，`payload` 原样保存（base64 文本），不重新编码
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryResource {
    /// 原始 ID，仅在单个文档内唯一
    pub id: String,
    pub content_type: String,
    pub payload: String,
}

impl BinaryResource {
    /// 是否为图片资源
    pub fn is_image(content_type: &str) -> bool {
        content_type.trim_start().starts_with(IMAGE_MIME_PREFIX)
    }
}

/// 可恢复的解析问题
///
/// 这些问题不会中断合并，只会让该文档贡献的内容变少
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParseDegradation {
    /// XML 语法错误，之后的内容被丢弃
    MalformedXml { position: u64, message: String },
    /// 结束标签与开始标签不匹配
    MismatchedTag { position: u64, expected: String, found: String },
    /// 文件在元素闭合前结束
    Truncated,
    /// 存在无法按检测到的编码解码的字节
    UndecodableText { encoding: String },
    /// 临时文件读取失败，整个文档按空文档处理
    Unreadable { message: String },
    /// 正文中有标签或实体被改写成合法形式
    RepairedMarkup { count: usize },
    MissingTitle,
    MissingBody,
}

/// 解析质量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseQuality {
    /// 结构完整
    Clean,
    /// 尽力恢复，部分内容可能缺失
    Degraded,
}

/// 单个源文档的解析结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedDocument {
    /// 书名（未转义的纯文本），缺失时为占位标题
    pub title: String,
    /// `<body>` 的内部标记，缺失时为空字符串
    pub body: String,
    /// 保留下来的图片资源，按文档中的顺序
    pub resources: Vec<BinaryResource>,
    /// 根元素和正文所在路径上声明的命名空间前缀 `(prefix, uri)`
    pub namespaces: Vec<(String, String)>,
    pub degradations: Vec<ParseDegradation>,
}

impl ParsedDocument {
    /// 完全无法解析时的默认结果
    pub fn fallback(default_title: &str, degradations: Vec<ParseDegradation>) -> Self {
        Self {
            title: default_title.to_string(),
            body: String::new(),
            resources: Vec::new(),
            namespaces: Vec::new(),
            degradations,
        }
    }

    pub fn quality(&self) -> ParseQuality {
        let degraded = self.degradations.iter().any(|d| {
            !matches!(
                d,
                ParseDegradation::MissingTitle
                    | ParseDegradation::MissingBody
                    | ParseDegradation::RepairedMarkup { .. }
            )
        });
        if degraded {
            ParseQuality::Degraded
        } else {
            ParseQuality::Clean
        }
    }
}

/// 判断上传的文件是否为 FB2
///
/// 文件名后缀或声明的媒体类型任一匹配即可
///
/// # 参数
/// - `name`: 原始文件名
/// - `mime`: 传输层给出的媒体类型
/// - `extension`: 认可的扩展名，例如 `.fb2`
/// - `accepted_mime`: 认可的媒体类型
pub fn is_supported(name: &str, mime: &str, extension: &str, accepted_mime: &str) -> bool {
    let stem = extension.trim_start_matches('.');
    let by_suffix = !stem.is_empty()
        && Path::new(name.trim())
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(stem))
            .unwrap_or(false);

    by_suffix || mime.trim().eq_ignore_ascii_case(accepted_mime)
}
