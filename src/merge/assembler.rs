use html_escape::{encode_double_quoted_attribute, encode_text};

use super::MergedBook;

/// FictionBook 2.0 命名空间
pub const FB2_NAMESPACE: &str = "http://www.gribuser.ru/xml/fictionbook/2.0";
/// 图片引用使用的 xlink 命名空间
pub const XLINK_NAMESPACE: &str = "http://www.w3.org/1999/xlink";

/// 生成最终的 FB2 文档
///
/// 结构：XML 声明、根元素、description/title-info/book-title、
/// 按提交顺序拼接的正文，以及（仅当存在图片时）每个图片一个 `binary` 元素
pub fn assemble(book: &MergedBook) -> String {
    let mut out = String::with_capacity(
        256 + book.bodies.iter().map(String::len).sum::<usize>()
            + book.resources.iter().map(|(_, r)| r.payload.len() + 64).sum::<usize>(),
    );

    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&root_open_tag(book));
    out.push_str("  <description>\n");
    out.push_str("    <title-info>\n");
    out.push_str("      <book-title>");
    out.push_str(&encode_text(&book.title));
    out.push_str("</book-title>\n");
    out.push_str("    </title-info>\n");
    out.push_str("  </description>\n");

    out.push_str("  <body>\n");
    for body in &book.bodies {
        if body.trim().is_empty() {
            continue;
        }
        out.push_str(body);
        out.push('\n');
    }
    out.push_str("  </body>\n");

    // 没有图片时不输出任何 binary 元素
    for (id, resource) in book.resources.iter() {
        out.push_str("  <binary id=\"");
        out.push_str(&encode_double_quoted_attribute(id));
        out.push_str("\" content-type=\"");
        out.push_str(&encode_double_quoted_attribute(&resource.content_type));
        out.push_str("\">");
        out.push_str(&resource.payload);
        out.push_str("</binary>\n");
    }

    out.push_str("</FictionBook>\n");
    out
}

/// 根元素开始标签
///
/// 默认命名空间和 `l` 前缀固定声明，其余前缀取自源文档，同名前缀以先出现的为准
fn root_open_tag(book: &MergedBook) -> String {
    let mut tag = format!("<FictionBook xmlns=\"{FB2_NAMESPACE}\" xmlns:l=\"{XLINK_NAMESPACE}\"");
    let mut declared: Vec<&str> = vec!["l"];

    for (prefix, uri) in &book.namespaces {
        if prefix == "xml" || prefix == "xmlns" || declared.contains(&prefix.as_str()) {
            continue;
        }
        declared.push(prefix);
        tag.push_str(&format!(" xmlns:{}=\"{}\"", prefix, encode_double_quoted_attribute(uri)));
    }

    tag.push_str(">\n");
    tag
}
