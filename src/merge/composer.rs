use regex::{Captures, Regex};
use std::sync::OnceLock;

use super::remapper::IdMapping;

/// 属性值形式的片段引用，例如 `l:href="#cover.jpg"`
fn reference_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r##"(=\s*)"#([^"<]*)"|(=\s*)'#([^'<]*)'"##).ok())
        .as_ref()
}

/// 用映射改写正文中的资源引用
///
/// 只替换整段属性值形如 `="#id"` 的引用，`#i1` 不会误伤 `#i10`，正文文字也不会被改动。
/// 引用先按实体解码再查映射；映射中没有的引用（悬空引用、脚注锚点）保持不变。
///
/// # 参数
/// - `body`: 单个文档的正文标记
/// - `mapping`: 仅属于该文档的 ID 映射
pub fn compose(body: &str, mapping: &IdMapping) -> String {
    if mapping.is_empty() || body.is_empty() {
        return body.to_string();
    }
    let Some(pattern) = reference_pattern() else {
        return body.to_string();
    };

    pattern
        .replace_all(body, |caps: &Captures| {
            let (eq, quote, id) = match (caps.get(1), caps.get(2), caps.get(3), caps.get(4)) {
                (Some(eq), Some(id), _, _) => (eq.as_str(), '"', id.as_str()),
                (_, _, Some(eq), Some(id)) => (eq.as_str(), '\'', id.as_str()),
                _ => return caps[0].to_string(),
            };
            let id = html_escape::decode_html_entities(id);
            match mapping.get(&*id) {
                Some(new_id) => format!("{eq}{quote}#{new_id}{quote}"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
