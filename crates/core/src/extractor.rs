use crate::error::ExtractError;
use lopdf::Document;

/// Lowercased extension used for type dispatch. Filenames without a dot are
/// treated as plain text.
pub fn extension_of(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => "txt".to_string(),
    }
}

/// Extract raw text from an uploaded payload based on the filename extension.
/// The caller is expected to run [`normalize_text`] on the result before
/// chunking.
pub fn extract_text(bytes: &[u8], filename: &str) -> Result<String, ExtractError> {
    let extension = extension_of(filename);
    match extension.as_str() {
        "pdf" => extract_pdf(bytes),
        "txt" | "md" => decode_text(bytes),
        other => Err(ExtractError::UnsupportedType(other.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let document =
        Document::load_mem(bytes).map_err(|error| ExtractError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| ExtractError::PdfParse(error.to_string()))?;
        pages.push(text);
    }

    Ok(pages.join("\n").trim().to_string())
}

/// Decode ladder for plain-text payloads: UTF-8, then UTF-16 (BOM-aware,
/// little-endian without one), then Latin-1. Latin-1 maps every byte, so it
/// is the terminal rung; a Windows-1252 rung after it would never be reached.
fn decode_text(bytes: &[u8]) -> Result<String, ExtractError> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(text.to_string());
    }
    if let Some(text) = decode_utf16(bytes) {
        return Ok(text);
    }
    Ok(decode_latin1(bytes))
}

fn decode_utf16(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return None;
    }

    let (little_endian, data) = match (bytes[0], bytes[1]) {
        (0xFF, 0xFE) => (true, &bytes[2..]),
        (0xFE, 0xFF) => (false, &bytes[2..]),
        _ => (true, bytes),
    };

    let units = data.chunks_exact(2).map(|pair| {
        if little_endian {
            u16::from_le_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], pair[1]])
        }
    });

    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| byte as char).collect()
}

/// Normalize extracted text: collapse whitespace runs to a single space,
/// strip control characters, fold typographic quotes and dashes to ASCII,
/// trim. Applying it twice yields the same string.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    collapsed
        .chars()
        .filter(|ch| !is_stripped_control(*ch))
        .map(fold_typographic)
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_stripped_control(ch: char) -> bool {
    matches!(ch,
        '\u{0000}'..='\u{0008}'
        | '\u{000B}'
        | '\u{000C}'
        | '\u{000E}'..='\u{001F}'
        | '\u{007F}'..='\u{009F}')
}

fn fold_typographic(ch: char) -> char {
    match ch {
        '\u{201C}' | '\u{201D}' => '"',
        '\u{2018}' | '\u{2019}' => '\'',
        '\u{2013}' | '\u{2014}' => '-',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_defaults_to_txt_without_dot() {
        assert_eq!(extension_of("notes"), "txt");
        assert_eq!(extension_of("report.PDF"), "pdf");
        assert_eq!(extension_of("a.b.md"), "md");
    }

    #[test]
    fn unsupported_extension_is_rejected_before_decoding() {
        let err = extract_text(b"PK\x03\x04", "slides.docx").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedType(ext) if ext == "docx"));
    }

    #[test]
    fn utf8_payload_decodes_directly() {
        let text = extract_text("héllo wörld".as_bytes(), "plain.txt").unwrap();
        assert_eq!(text, "héllo wörld");
    }

    #[test]
    fn utf16_payload_decodes_with_and_without_bom() {
        let mut with_bom = vec![0xFF, 0xFE];
        for unit in "hi there".encode_utf16() {
            with_bom.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(extract_text(&with_bom, "a.txt").unwrap(), "hi there");

        let big_endian: Vec<u8> = [0xFE, 0xFF]
            .into_iter()
            .chain("ok".encode_utf16().flat_map(|unit| unit.to_be_bytes()))
            .collect();
        assert_eq!(extract_text(&big_endian, "a.txt").unwrap(), "ok");
    }

    #[test]
    fn undecodable_bytes_fall_back_to_latin1() {
        // 0xE9 alone is invalid UTF-8 and odd-length for UTF-16.
        let text = extract_text(&[0x63, 0x61, 0x66, 0xE9, 0x21], "a.txt").unwrap();
        assert_eq!(text, "café!");
    }

    #[test]
    fn garbage_pdf_bytes_fail_parse() {
        let err = extract_text(b"not a pdf at all", "broken.pdf").unwrap_err();
        assert!(matches!(err, ExtractError::PdfParse(_)));
    }

    #[test]
    fn normalize_collapses_strips_and_folds() {
        let input = "  “Smart”\u{0007} quotes\u{0013} —  and\t\tspacing\u{2019}s  ";
        let normalized = normalize_text(input);
        assert_eq!(normalized, "\"Smart\" quotes - and spacing's");
    }

    #[test]
    fn normalize_is_idempotent() {
        let input = "A –dash— and “quoted”\n\ntext\u{000C}here";
        let once = normalize_text(input);
        let twice = normalize_text(&once);
        assert_eq!(once, twice);
    }
}
