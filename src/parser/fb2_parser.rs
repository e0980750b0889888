use super::*;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::sync::OnceLock;

/// FB2 解析器
///
/// 容错解析：XML 出错时保留出错前已经完整读到的部分，不向调用方返回错误
#[derive(Clone)]
pub struct Fb2Parser {
    default_title: String,
}

/// 需要截取原文的元素
enum Target {
    Title,
    Body,
    Binary { id: String, content_type: String },
}

/// 正在截取的元素
struct Capture {
    target: Target,
    /// 元素开始时栈的深度
    depth: usize,
    /// 开始标签之后的字节位置
    start: usize,
    /// 内部出现过不匹配的标签，截取结果不可靠
    tainted: bool,
    /// 需要替换的原文片段，按位置递增
    patches: Vec<Patch>,
}

/// 对原文 `start..end` 的替换
struct Patch {
    start: usize,
    end: usize,
    text: String,
}

impl Capture {
    /// 只修补正文；书名另行清理，图片数据原样保留
    fn repairs(&self) -> bool {
        matches!(self.target, Target::Body)
    }
}

/// 一次扫描的原始结果，切片都指向解码后的文本
#[derive(Default)]
struct Scan<'a> {
    title: Option<&'a str>,
    title_seen: bool,
    body: Option<String>,
    body_seen: bool,
    resources: Vec<BinaryResource>,
    namespaces: Vec<(String, String)>,
    degradations: Vec<ParseDegradation>,
}

impl Fb2Parser {
    /// 创建新的 FB2 解析器实例
    ///
    /// # 参数
    /// - `default_title`: 书名缺失时使用的占位标题
    pub fn new(default_title: impl Into<String>) -> Self {
        Self {
            default_title: default_title.into(),
        }
    }

    /// 解析一个源文档
    ///
    /// 永远返回结果；无法解析的部分记录在 `degradations` 中
    pub fn parse(&self, bytes: &[u8]) -> ParsedDocument {
        let decoded = encoding::decode(bytes);
        let mut degradations = Vec::new();
        if decoded.had_errors {
            degradations.push(ParseDegradation::UndecodableText {
                encoding: decoded.encoding.name().to_string(),
            });
        }

        let scan = scan(&decoded.text);
        degradations.extend(scan.degradations);

        let title = match scan.title.map(clean_title).filter(|t| !t.is_empty()) {
            Some(title) => title,
            None => {
                degradations.push(ParseDegradation::MissingTitle);
                self.default_title.clone()
            }
        };

        let body = match scan.body {
            Some(body) => body,
            None => {
                degradations.push(ParseDegradation::MissingBody);
                String::new()
            }
        };

        ParsedDocument {
            title,
            body,
            resources: scan.resources,
            namespaces: scan.namespaces,
            degradations,
        }
    }
}

impl<'a> Scan<'a> {
    /// 判断当前元素是否需要截取
    fn target_for(&mut self, stack: &[Vec<u8>], name: &[u8], element: &BytesStart) -> Option<Target> {
        match name {
            b"book-title" if !self.title_seen && in_title_info(stack) => {
                self.title_seen = true;
                Some(Target::Title)
            }
            b"body" if !self.body_seen => {
                self.body_seen = true;
                Some(Target::Body)
            }
            b"binary" => {
                let mut id = None;
                let mut content_type = None;
                for attr in element.attributes().flatten() {
                    match attr.key.local_name().as_ref() {
                        b"id" => id = attr_value(&attr),
                        b"content-type" => content_type = attr_value(&attr),
                        _ => {}
                    }
                }
                let id = id.filter(|id| !id.trim().is_empty())?;
                let content_type = content_type.filter(|ct| BinaryResource::is_image(ct))?;
                Some(Target::Binary {
                    id: id.trim().to_string(),
                    content_type: content_type.trim().to_string(),
                })
            }
            _ => None,
        }
    }

    fn finish(&mut self, target: Target, raw: &'a str, offset: usize, patches: &[Patch]) {
        match target {
            Target::Title => self.title = Some(raw),
            Target::Body => {
                if !patches.is_empty() {
                    self.degradations.push(ParseDegradation::RepairedMarkup { count: patches.len() });
                }
                self.body = Some(apply_patches(raw, offset, patches));
            }
            Target::Binary { id, content_type } => self.resources.push(BinaryResource {
                id,
                content_type,
                payload: raw.trim().to_string(),
            }),
        }
    }

    /// 记录元素上的 `xmlns:prefix` 声明
    ///
    /// 正文只保留内部标记，`<body>` 及其祖先上的声明都要提升到输出的根元素，
    /// 同名前缀以先出现的为准
    fn collect_namespaces(&mut self, element: &BytesStart) {
        for attr in element.attributes().flatten() {
            let key = attr.key.as_ref();
            if let Some(prefix) = key.strip_prefix(b"xmlns:") {
                if let (Ok(prefix), Some(uri)) = (std::str::from_utf8(prefix), attr_value(&attr)) {
                    if !self.namespaces.iter().any(|(p, _)| p == prefix) {
                        self.namespaces.push((prefix.to_string(), uri));
                    }
                }
            }
        }
    }
}

/// 扫描文档，记录书名、正文和图片在原文中的位置
fn scan(text: &str) -> Scan<'_> {
    let mut reader = Reader::from_str(text);
    {
        let config = reader.config_mut();
        config.trim_text(false);
        // 结束标签由下面自己匹配，便于恢复
        config.check_end_names = false;
        // 裸露的 `&` 当作文本读出，在正文里转义
        config.allow_dangling_amp = true;
    }

    let mut scan = Scan::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut capture: Option<Capture> = None;
    let mut failed = false;

    loop {
        let before = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                scan.degradations.push(ParseDegradation::MalformedXml {
                    position: before as u64,
                    message: e.to_string(),
                });
                failed = true;
                break;
            }
        };
        let after = reader.buffer_position() as usize;

        match event {
            Event::Start(e) => {
                scan.collect_namespaces(&e);
                if let Some(c) = capture.as_mut().filter(|c| c.repairs()) {
                    if let Some(tag) = repaired_tag(&e, false) {
                        c.patches.push(Patch { start: before, end: after, text: tag });
                    }
                }
                let name = e.local_name().as_ref().to_vec();
                if capture.is_none() {
                    if let Some(target) = scan.target_for(&stack, &name, &e) {
                        capture = Some(Capture {
                            target,
                            depth: stack.len(),
                            start: after,
                            tainted: false,
                            patches: Vec::new(),
                        });
                    }
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                scan.collect_namespaces(&e);
                match capture.as_mut() {
                    Some(c) => {
                        if c.repairs() {
                            if let Some(tag) = repaired_tag(&e, true) {
                                c.patches.push(Patch { start: before, end: after, text: tag });
                            }
                        }
                    }
                    None => {
                        let name = e.local_name();
                        if let Some(target) = scan.target_for(&stack, name.as_ref(), &e) {
                            scan.finish(target, "", 0, &[]);
                        }
                    }
                }
            }
            Event::GeneralRef(r) => {
                if let Some(c) = capture.as_mut().filter(|c| c.repairs()) {
                    if !is_valid_reference(&r) {
                        c.patches.push(Patch {
                            start: before,
                            end: after,
                            text: replace_reference(&r),
                        });
                    }
                }
            }
            Event::Text(_) => {
                if let Some(c) = capture.as_mut().filter(|c| c.repairs()) {
                    if let Some(raw) = text.get(before..after).filter(|raw| raw.contains('&')) {
                        c.patches.push(Patch {
                            start: before,
                            end: after,
                            text: raw.replace('&', "&amp;"),
                        });
                    }
                }
            }
            Event::End(e) => {
                let name = e.local_name();
                let name = name.as_ref();
                let expected = stack.last().map(|n| String::from_utf8_lossy(n).into_owned());

                match stack.iter().rposition(|open| open.as_slice() == name) {
                    Some(index) => {
                        if index + 1 != stack.len() {
                            // 跳过了未闭合的子元素
                            scan.degradations.push(ParseDegradation::MismatchedTag {
                                position: before as u64,
                                expected: expected.unwrap_or_default(),
                                found: String::from_utf8_lossy(name).into_owned(),
                            });
                            if let Some(c) = capture.as_mut() {
                                c.tainted = true;
                            }
                        }
                        stack.truncate(index);
                    }
                    None => {
                        // 多余的结束标签，忽略
                        scan.degradations.push(ParseDegradation::MismatchedTag {
                            position: before as u64,
                            expected: expected.unwrap_or_default(),
                            found: String::from_utf8_lossy(name).into_owned(),
                        });
                        if let Some(c) = capture.as_mut() {
                            c.tainted = true;
                        }
                        continue;
                    }
                }

                if capture.as_ref().is_some_and(|c| stack.len() <= c.depth) {
                    if let Some(c) = capture.take() {
                        match text.get(c.start..before) {
                            Some(raw) if !c.tainted => scan.finish(c.target, raw, c.start, &c.patches),
                            _ => {}
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !failed && (!stack.is_empty() || capture.is_some()) {
        scan.degradations.push(ParseDegradation::Truncated);
    }

    scan
}

/// 栈顶是否为 description/title-info
fn in_title_info(stack: &[Vec<u8>]) -> bool {
    match stack {
        [.., description, title_info] => {
            description.as_slice() == b"description" && title_info.as_slice() == b"title-info"
        }
        _ => false,
    }
}

/// 读取属性值并反转义，非 UTF-8 的属性视为不存在
fn attr_value(attr: &Attribute) -> Option<String> {
    let raw = std::str::from_utf8(&attr.value).ok()?;
    Some(html_escape::decode_html_entities(raw).into_owned())
}

/// 属性值能否原样放进输出
fn is_valid_attr_value(raw: &[u8]) -> bool {
    match std::str::from_utf8(raw) {
        Ok(raw) => !raw.contains('<') && quick_xml::escape::unescape(raw).is_ok(),
        Err(_) => false,
    }
}

/// 属性有问题时重新生成开始标签，没有问题返回 None
///
/// 未加引号的值会补上引号，重复的属性只保留第一个，值按 HTML 实体解码后重新转义
fn repaired_tag(element: &BytesStart, self_closing: bool) -> Option<String> {
    let strict_ok = element
        .attributes()
        .all(|attr| attr.is_ok_and(|a| is_valid_attr_value(&a.value)));
    if strict_ok {
        return None;
    }

    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut tag = format!("<{name}");
    let mut seen: Vec<String> = Vec::new();

    let mut attrs = element.html_attributes();
    attrs.with_checks(false);
    for attr in attrs.flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if !is_xml_name(&key) || seen.contains(&key) {
            continue;
        }
        let raw = String::from_utf8_lossy(&attr.value);
        let value = html_escape::decode_html_entities(&raw);
        let value: String = value.chars().filter(|&c| is_xml_char(c)).collect();
        tag.push_str(&format!(" {key}=\"{}\"", html_escape::encode_double_quoted_attribute(&value)));
        seen.push(key);
    }

    tag.push_str(if self_closing { "/>" } else { ">" });
    Some(tag)
}

/// 预定义实体和合法的字符引用可以原样保留
fn is_valid_reference(reference: &BytesRef) -> bool {
    if reference.is_char_ref() {
        return matches!(reference.resolve_char_ref(), Ok(Some(c)) if is_xml_char(c));
    }
    matches!(&**reference, b"lt" | b"gt" | b"amp" | b"apos" | b"quot")
}

/// 未定义的实体按 HTML 实体解码，认不出的转义成文本
fn replace_reference(reference: &BytesRef) -> String {
    let raw = format!("&{};", String::from_utf8_lossy(reference));
    let decoded: String = html_escape::decode_html_entities(&raw)
        .chars()
        .filter(|&c| is_xml_char(c))
        .collect();
    html_escape::encode_text(&decoded).into_owned()
}

fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r') || (c >= ' ' && c != '\u{FFFE}' && c != '\u{FFFF}')
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.'))
}

/// 把截取的原文按补丁替换，`offset` 是原文在整个文档中的起始位置
fn apply_patches(raw: &str, offset: usize, patches: &[Patch]) -> String {
    if patches.is_empty() {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut cursor = 0;
    for patch in patches {
        let (Some(start), Some(end)) = (patch.start.checked_sub(offset), patch.end.checked_sub(offset)) else {
            continue;
        };
        let Some(kept) = raw.get(cursor..start).filter(|_| end <= raw.len()) else {
            continue;
        };
        out.push_str(kept);
        out.push_str(&patch.text);
        cursor = end;
    }
    out.push_str(raw.get(cursor..).unwrap_or_default());
    out
}

/// 把书名原文转为纯文本：去掉内嵌标签、反转义、合并空白
fn clean_title(raw: &str) -> String {
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    let stripped = match TAGS.get_or_init(|| Regex::new(r"<[^>]*>").ok()) {
        Some(re) => re.replace_all(raw, " "),
        None => raw.into(),
    };
    let text = html_escape::decode_html_entities(&stripped);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> Fb2Parser {
        Fb2Parser::new("Untitled")
    }

    const SAMPLE: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<FictionBook xmlns="http://www.gribuser.ru/xml/fictionbook/2.0" xmlns:l="http://www.w3.org/1999/xlink">
  <description>
    <title-info>
      <book-title>Tom &amp; Jerry</book-title>
    </title-info>
  </description>
  <body><section><p>Hello</p><image l:href="#cover.jpg"/></section></body>
  <body name="notes"><section id="n1"><p>note</p></section></body>
  <binary id="cover.jpg" content-type="image/jpeg">
    /9j/4AAQ
  </binary>
  <binary id="font" content-type="application/x-font-ttf">AAAA</binary>
</FictionBook>"##;

    #[test]
    fn test_parse_well_formed() {
        let doc = parser().parse(SAMPLE.as_bytes());
        assert_eq!(doc.title, "Tom & Jerry");
        assert_eq!(doc.body, r##"<section><p>Hello</p><image l:href="#cover.jpg"/></section>"##);
        assert_eq!(doc.quality(), ParseQuality::Clean);
        assert!(doc.degradations.is_empty());
    }

    #[test]
    fn test_only_images_are_kept() {
        let doc = parser().parse(SAMPLE.as_bytes());
        assert_eq!(doc.resources.len(), 1);
        assert_eq!(doc.resources[0].id, "cover.jpg");
        assert_eq!(doc.resources[0].content_type, "image/jpeg");
        assert_eq!(doc.resources[0].payload, "/9j/4AAQ");
    }

    #[test]
    fn test_root_namespaces_collected() {
        let doc = parser().parse(SAMPLE.as_bytes());
        assert_eq!(
            doc.namespaces,
            vec![("l".to_string(), "http://www.w3.org/1999/xlink".to_string())]
        );
    }

    #[test]
    fn test_missing_title_and_body() {
        let xml = r#"<FictionBook><description/></FictionBook>"#;
        let doc = parser().parse(xml.as_bytes());
        assert_eq!(doc.title, "Untitled");
        assert_eq!(doc.body, "");
        assert!(doc.degradations.contains(&ParseDegradation::MissingTitle));
        assert!(doc.degradations.contains(&ParseDegradation::MissingBody));
    }

    #[test]
    fn test_title_outside_title_info_ignored() {
        let xml = r#"<FictionBook><description><document-info><book-title>Wrong</book-title></document-info></description><body/></FictionBook>"#;
        let doc = parser().parse(xml.as_bytes());
        assert_eq!(doc.title, "Untitled");
        assert_eq!(doc.body, "");
    }

    #[test]
    fn test_garbage_input_falls_back() {
        let doc = parser().parse(b"this is not xml <<<");
        assert_eq!(doc.title, "Untitled");
        assert_eq!(doc.body, "");
        assert!(doc.resources.is_empty());
        assert_eq!(doc.quality(), ParseQuality::Degraded);
    }

    #[test]
    fn test_truncated_body_dropped_title_kept() {
        let xml = r#"<FictionBook><description><title-info><book-title>Half</book-title></title-info></description><body><p>cut"#;
        let doc = parser().parse(xml.as_bytes());
        assert_eq!(doc.title, "Half");
        assert_eq!(doc.body, "");
        assert!(doc.degradations.contains(&ParseDegradation::Truncated));
    }

    #[test]
    fn test_mismatched_tag_inside_body_drops_body() {
        let xml = r#"<FictionBook><body><p>x</i></body><binary id="a" content-type="image/png">QQ==</binary></FictionBook>"#;
        let doc = parser().parse(xml.as_bytes());
        assert_eq!(doc.body, "");
        assert_eq!(doc.resources.len(), 1);
        assert!(doc
            .degradations
            .iter()
            .any(|d| matches!(d, ParseDegradation::MismatchedTag { .. })));
    }

    #[test]
    fn test_unclosed_child_recovered_by_ancestor_end() {
        let xml = r#"<FictionBook><description><title-info><book-title>Ok</book-title><author></title-info></description><body><p>y</p></body></FictionBook>"#;
        let doc = parser().parse(xml.as_bytes());
        assert_eq!(doc.title, "Ok");
        assert_eq!(doc.body, "<p>y</p>");
    }

    #[test]
    fn test_windows_1251_title() {
        let xml = "<?xml version=\"1.0\" encoding=\"windows-1251\"?><FictionBook><description><title-info><book-title>Война и мир</book-title></title-info></description><body><p>Текст</p></body></FictionBook>";
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode(xml);
        let doc = parser().parse(&bytes);
        assert_eq!(doc.title, "Война и мир");
        assert_eq!(doc.body, "<p>Текст</p>");
    }

    #[test]
    fn test_title_markup_and_whitespace_flattened() {
        let xml = "<FictionBook><description><title-info><book-title>\n  Big <emphasis>Book</emphasis>\n</book-title></title-info></description></FictionBook>";
        let doc = parser().parse(xml.as_bytes());
        assert_eq!(doc.title, "Big Book");
    }

    #[test]
    fn test_binary_without_id_skipped() {
        let xml = r#"<FictionBook><binary content-type="image/png">QQ==</binary></FictionBook>"#;
        let doc = parser().parse(xml.as_bytes());
        assert!(doc.resources.is_empty());
    }

    fn body_of(inner: &str) -> ParsedDocument {
        let xml = format!("<FictionBook><description><title-info><book-title>T</book-title></title-info></description><body>{inner}</body></FictionBook>");
        parser().parse(xml.as_bytes())
    }

    #[test]
    fn test_unquoted_attribute_requoted() {
        let doc = body_of("<p id=x1>a</p>");
        assert_eq!(doc.body, r#"<p id="x1">a</p>"#);
        assert!(doc.degradations.contains(&ParseDegradation::RepairedMarkup { count: 1 }));
        assert_eq!(doc.quality(), ParseQuality::Clean);
    }

    #[test]
    fn test_duplicate_attribute_keeps_first() {
        let doc = body_of(r#"<p a="1" a="2"/>"#);
        assert_eq!(doc.body, r#"<p a="1"/>"#);
    }

    #[test]
    fn test_html_entity_decoded() {
        let doc = body_of("<p>a&nbsp;b &amp; c&#169;</p>");
        assert_eq!(doc.body, "<p>a\u{a0}b &amp; c&#169;</p>");
    }

    #[test]
    fn test_unknown_entity_escaped() {
        let doc = body_of("<p>x&bogus;y</p>");
        assert_eq!(doc.body, "<p>x&amp;bogus;y</p>");
    }

    #[test]
    fn test_bare_ampersand_escaped() {
        let doc = body_of("<p>Tom & Jerry</p>");
        assert_eq!(doc.body, "<p>Tom &amp; Jerry</p>");
    }

    #[test]
    fn test_well_formed_body_untouched() {
        let doc = body_of(r#"<p class="a &amp; b">x &lt; y</p>"#);
        assert_eq!(doc.body, r#"<p class="a &amp; b">x &lt; y</p>"#);
        assert!(doc.degradations.is_empty());
    }

    #[test]
    fn test_body_namespace_declarations_collected() {
        let xml = r##"<FictionBook xmlns:l="http://www.w3.org/1999/xlink"><body xmlns:xl="urn:other"><image xl:href="#i"/></body></FictionBook>"##;
        let doc = parser().parse(xml.as_bytes());
        assert_eq!(doc.body, r##"<image xl:href="#i"/>"##);
        assert_eq!(
            doc.namespaces,
            vec![
                ("l".to_string(), "http://www.w3.org/1999/xlink".to_string()),
                ("xl".to_string(), "urn:other".to_string()),
            ]
        );
    }

    #[test]
    fn test_binary_id_entities_decoded() {
        let xml = r#"<FictionBook><binary id="a&amp;b" content-type="image/png">QQ==</binary></FictionBook>"#;
        let doc = parser().parse(xml.as_bytes());
        assert_eq!(doc.resources[0].id, "a&b");
    }
}
