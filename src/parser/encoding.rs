use encoding_rs::{Encoding, UTF_8, WINDOWS_1251};
use regex::bytes::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// 解码结果
pub struct Decoded<'a> {
    pub text: Cow<'a, str>,
    pub encoding: &'static Encoding,
    /// 是否有无法解码、被替换的字节
    pub had_errors: bool,
}

/// 检测 FB2 文件编码并解码为 UTF-8 文本
///
/// 检测顺序：
/// 1. BOM (Byte Order Mark)
/// 2. XML 声明中的 encoding 标签
/// 3. 严格 UTF-8
/// 4. 默认 windows-1251（俄文 FB2 最常见的编码）
///
/// # 参数
/// - `bytes`: 文件字节数据
pub fn decode(bytes: &[u8]) -> Decoded<'_> {
    let encoding = detect_encoding(bytes);
    // decode 会自行处理并去掉 BOM
    let (text, encoding, had_errors) = encoding.decode(bytes);
    Decoded {
        text,
        encoding,
        had_errors,
    }
}

/// 检测文件编码
pub fn detect_encoding(bytes: &[u8]) -> &'static Encoding {
    if let Some((encoding, _bom_length)) = Encoding::for_bom(bytes) {
        return encoding;
    }

    if let Some(encoding) = declared_encoding(bytes) {
        return encoding;
    }

    if std::str::from_utf8(bytes).is_ok() {
        return UTF_8;
    }

    WINDOWS_1251
}

/// 从 XML 声明中读取 encoding 标签
///
/// 只看文件开头，声明之外的 encoding 字样不算
fn declared_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    static DECLARATION: OnceLock<Option<Regex>> = OnceLock::new();
    let re = DECLARATION
        .get_or_init(|| Regex::new(r#"^\s*<\?xml[^>]*?encoding\s*=\s*["']([A-Za-z0-9._:\-]+)["']"#).ok())
        .as_ref()?;

    let head = &bytes[..bytes.len().min(256)];
    let label = re.captures(head)?.get(1)?.as_bytes();
    Encoding::for_label(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_utf8() {
        let decoded = decode("<p>Привет</p>".as_bytes());
        assert_eq!(decoded.encoding, UTF_8);
        assert_eq!(decoded.text, "<p>Привет</p>");
        assert!(!decoded.had_errors);
    }

    #[test]
    fn test_declared_windows_1251() {
        let (body, _, _) = WINDOWS_1251.encode("<p>Глава</p>");
        let mut bytes = br#"<?xml version="1.0" encoding="windows-1251"?>"#.to_vec();
        bytes.extend_from_slice(&body);

        let decoded = decode(&bytes);
        assert_eq!(decoded.encoding, WINDOWS_1251);
        assert!(decoded.text.ends_with("<p>Глава</p>"));
    }

    #[test]
    fn test_undeclared_non_utf8_falls_back_to_1251() {
        let (bytes, _, _) = WINDOWS_1251.encode("Книга");
        assert_eq!(detect_encoding(&bytes), WINDOWS_1251);
    }

    #[test]
    fn test_bom_wins_over_declaration() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(br#"<?xml version="1.0" encoding="windows-1251"?><a/>"#);
        let decoded = decode(&bytes);
        assert_eq!(decoded.encoding, UTF_8);
        assert!(decoded.text.starts_with("<?xml"));
    }

    #[test]
    fn test_unknown_label_ignored() {
        let bytes = br#"<?xml version="1.0" encoding="no-such-charset"?><a/>"#;
        assert_eq!(detect_encoding(bytes), UTF_8);
    }
}
