use calamine::{open_workbook_auto_from_rs, Data, Reader};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use thiserror::Error;
use zip::ZipArchive;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Pptx,
    Spreadsheet,
    Rtf,
    PlainText,
}

impl DocumentKind {
    /// Picks a format from the MIME type first, then the file name extension.
    pub fn detect(file_name: Option<&str>, mime_type: Option<&str>) -> Self {
        let mime = mime_type
            .map(|m| m.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();
        let by_mime = match mime.as_str() {
            "application/pdf" => Some(Self::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
                Some(Self::Pptx)
            }
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel"
            | "application/vnd.ms-excel.sheet.binary.macroenabled.12"
            | "application/vnd.oasis.opendocument.spreadsheet" => Some(Self::Spreadsheet),
            "application/rtf" | "text/rtf" => Some(Self::Rtf),
            _ => None,
        };
        if let Some(kind) = by_mime {
            return kind;
        }
        let ext = file_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        Self::from_extension(&ext)
    }

    fn from_extension(ext: &str) -> Self {
        match ext {
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "pptx" => Self::Pptx,
            "xlsx" | "xls" | "ods" | "xlsb" => Self::Spreadsheet,
            "rtf" => Self::Rtf,
            _ => Self::PlainText,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractLimits {
    pub max_file_bytes: u64,
    pub max_output_chars: usize,
    pub max_xml_bytes: usize,
    pub max_sheets: usize,
    pub max_rows: usize,
    pub max_cols: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 25 * 1024 * 1024,
            max_output_chars: 200_000,
            max_xml_bytes: 5 * 1024 * 1024,
            max_sheets: 6,
            max_rows: 200,
            max_cols: 30,
        }
    }
}

/// Extracts readable text from an in-memory document.
pub fn extract_bytes_text(bytes: &[u8], kind: DocumentKind, limits: &ExtractLimits) -> Result<String> {
    if bytes.len() as u64 > limits.max_file_bytes {
        return Err(DocumentError::InvalidDocument(format!(
            "Document too large for text extraction: {} bytes (limit: {} bytes)",
            bytes.len(),
            limits.max_file_bytes
        )));
    }

    let text = match kind {
        DocumentKind::Pdf => pdf_extract::extract_text_from_mem(bytes).map_err(|e| {
            DocumentError::ExtractionFailed(format!("Failed to extract PDF text: {}", e))
        })?,
        DocumentKind::Docx => {
            let xml = read_zip_entry(bytes, "word/document.xml", limits.max_xml_bytes)?;
            ooxml_text(&xml, b"p")?
        }
        DocumentKind::Pptx => pptx_text(bytes, limits.max_xml_bytes)?,
        DocumentKind::Spreadsheet => spreadsheet_text(bytes, limits)?,
        DocumentKind::Rtf => rtf_text(bytes),
        DocumentKind::PlainText => String::from_utf8(bytes.to_vec()).map_err(|_| {
            DocumentError::InvalidDocument("Document is not valid UTF-8 text".to_string())
        })?,
    };

    Ok(truncate_output(text, limits.max_output_chars))
}

fn truncate_output(text: String, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    match text.char_indices().nth(max_chars) {
        None => text,
        Some((cut, _)) => {
            let mut out = text[..cut].to_string();
            out.push_str("\n\n...[truncated]...\n");
            out
        }
    }
}

fn open_zip(bytes: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
        DocumentError::InvalidDocument(format!("Failed to open zip container: {}", e))
    })
}

fn read_zip_entry(bytes: &[u8], inner_path: &str, max_bytes: usize) -> Result<Vec<u8>> {
    let mut zip = open_zip(bytes)?;
    let entry = zip.by_name(inner_path).map_err(|e| {
        DocumentError::InvalidDocument(format!("Zip entry '{}' not found: {}", inner_path, e))
    })?;
    let mut out = Vec::new();
    entry
        .take(max_bytes as u64)
        .read_to_end(&mut out)
        .map_err(|e| DocumentError::ExtractionFailed(format!("Failed reading zip entry: {}", e)))?;
    Ok(out)
}

/// Collects `<*:t>` runs from WordprocessingML / DrawingML, breaking lines at
/// the given paragraph element.
fn ooxml_text(xml: &[u8], paragraph: &[u8]) -> Result<String> {
    let mut reader = XmlReader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut out = String::new();
    let mut in_text = false;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"t" => in_text = true,
                    name if name == paragraph => {
                        if !out.is_empty() && !out.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = false;
                }
            }
            Ok(Event::Text(t)) if in_text => {
                let text = t.decode().map_err(|e| {
                    DocumentError::ExtractionFailed(format!("XML decode error: {}", e))
                })?;
                out.push_str(&text);
            }
            Ok(Event::GeneralRef(r)) if in_text => {
                let name = r.decode().map_err(|e| {
                    DocumentError::ExtractionFailed(format!("XML decode error: {}", e))
                })?;
                if let Some(ch) = resolve_entity(&name) {
                    out.push(ch);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(DocumentError::ExtractionFailed(format!(
                    "Failed parsing OOXML XML: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

fn resolve_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = name.strip_prefix('#')?;
            let value = match code.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse::<u32>().ok()?,
            };
            char::from_u32(value)
        }
    }
}

fn pptx_text(bytes: &[u8], max_xml_bytes: usize) -> Result<String> {
    let mut zip = open_zip(bytes)?;

    // slide2 must sort before slide10
    let mut slides: BTreeMap<(usize, String), String> = BTreeMap::new();
    for i in 0..zip.len() {
        let Ok(entry) = zip.by_index(i) else {
            continue;
        };
        let name = entry.name().to_string();
        let Some(number) = name
            .strip_prefix("ppt/slides/slide")
            .and_then(|rest| rest.strip_suffix(".xml"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let mut xml = Vec::new();
        entry
            .take(max_xml_bytes as u64)
            .read_to_end(&mut xml)
            .map_err(|e| {
                DocumentError::ExtractionFailed(format!("Failed reading slide XML: {}", e))
            })?;
        slides.insert((number, name), ooxml_text(&xml, b"p")?);
    }

    if slides.is_empty() {
        return Err(DocumentError::InvalidDocument(
            "No slide XML found in presentation".to_string(),
        ));
    }

    Ok(slides
        .into_iter()
        .map(|((number, _), text)| format!("# Slide {}\n{}\n", number, text.trim()))
        .collect::<Vec<_>>()
        .join("\n"))
}

fn spreadsheet_text(bytes: &[u8], limits: &ExtractLimits) -> Result<String> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| {
        DocumentError::InvalidDocument(format!("Failed to open spreadsheet: {}", e))
    })?;

    let mut out = String::new();
    for (idx, sheet) in workbook.sheet_names().to_vec().into_iter().enumerate() {
        if idx >= limits.max_sheets {
            out.push_str("...[more sheets truncated]...\n");
            break;
        }
        let Ok(range) = workbook.worksheet_range(&sheet) else {
            continue;
        };
        out.push_str(&format!("# Sheet: {}\n", sheet));
        for row in range.rows().take(limits.max_rows) {
            let cells = row
                .iter()
                .take(limits.max_cols)
                .map(|cell| match cell {
                    Data::Empty => String::new(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>();
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out.push('\n');
    }
    Ok(out)
}

/// Plain text of an RTF body: control words and group braces are dropped,
/// `\'hh` escapes decode as Latin-1.
fn rtf_text(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut iter = bytes.iter().copied().peekable();

    while let Some(byte) = iter.next() {
        match byte {
            b'{' | b'}' | b'\r' | b'\n' => {}
            b'\\' => match iter.peek().copied() {
                Some(escaped @ (b'\\' | b'{' | b'}')) => {
                    out.push(escaped as char);
                    iter.next();
                }
                Some(b'\'') => {
                    iter.next();
                    let hex = [iter.next(), iter.next()];
                    let decoded = match hex {
                        [Some(h), Some(l)] => std::str::from_utf8(&[h, l])
                            .ok()
                            .and_then(|s| u8::from_str_radix(s, 16).ok()),
                        _ => None,
                    };
                    if let Some(value) = decoded {
                        out.push(value as char);
                    }
                }
                Some(b'\r' | b'\n') => {
                    iter.next();
                    out.push('\n');
                }
                _ => {
                    while iter.next_if(|b| b.is_ascii_alphabetic()).is_some() {}
                    while iter.next_if(|b| b.is_ascii_digit() || *b == b'-').is_some() {}
                    iter.next_if_eq(&b' ');
                }
            },
            other => out.push(other as char),
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_prefers_mime_over_extension() {
        assert_eq!(
            DocumentKind::detect(Some("notes.txt"), Some("application/pdf")),
            DocumentKind::Pdf
        );
        assert_eq!(
            DocumentKind::detect(Some("Report.DOCX"), Some("application/octet-stream")),
            DocumentKind::Docx
        );
        assert_eq!(DocumentKind::detect(None, None), DocumentKind::PlainText);
    }

    #[test]
    fn ooxml_text_handles_runs_breaks_and_entities() {
        let xml = br#"<w:document xmlns:w="w"><w:body>
<w:p><w:r><w:t>Fish &amp; chips</w:t></w:r><w:r><w:tab/><w:t>5</w:t></w:r></w:p>
<w:p><w:r><w:instrText>PAGE</w:instrText><w:t>Second</w:t><w:br/><w:t>line</w:t></w:r></w:p>
</w:body></w:document>"#;
        let text = ooxml_text(xml, b"p").expect("text");
        assert_eq!(text, "Fish & chips\t5\nSecond\nline");
    }

    #[test]
    fn truncate_output_marks_cut_text() {
        assert_eq!(truncate_output("héllo".to_string(), 10), "héllo");
        let cut = truncate_output("héllo".to_string(), 2);
        assert!(cut.starts_with("hé\n\n...[truncated]..."));
    }

    #[test]
    fn rtf_escapes_decode() {
        let text = rtf_text(br"{\rtf1\ansi caf\'e9 \{braces\} and\par more}");
        assert_eq!(text, "caf\u{e9} {braces} and more");
    }
}
