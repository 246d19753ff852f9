//! Multi-format text extraction for uploaded case files.
//!
//! The job runner supplies raw bytes + filename; this module returns ordered
//! page texts covering the whole document. Dispatch is by file extension:
//!
//! | Extension | Handling |
//! |-----------|----------|
//! | `.pdf` | page-by-page extraction; encrypted files fail terminally |
//! | `.docx` | paragraph text from `word/document.xml`, one unnumbered page |
//! | `.txt` `.md` `.markdown` `.rtf` `.csv` | verbatim decode |
//! | `.html` `.htm` | tag-stripped to readable text |
//! | `.eml` `.msg` | header block above the decoded body |
//! | images | vision text-recognition call, bounded by a timeout |
//! | `.zip` | never extracted here; the job runner fans archives out |
//! | anything else | `UnsupportedFormat`, terminal for the job |
//!
//! Everything except the image path is a pure function over the byte buffer.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

use crate::blob::BlobStore;
use crate::error::{PipelineError, Result};
use crate::llm::GenAiClient;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb bound).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// One extracted page. `page_number` is 1-based for paginated formats and
/// `None` for single-page formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub page_number: Option<i64>,
    pub text: String,
}

/// Extractor output: ordered, non-overlapping pages covering the document.
/// Serializes as the job's stored-extraction artifact, which is also what a
/// reclaimed job resumes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub pages: Vec<PageText>,
}

impl Extraction {
    fn single(text: String) -> Self {
        Extraction {
            pages: vec![PageText {
                page_number: None,
                text,
            }],
        }
    }

    /// All pages joined, the flattened form mirrored to the provider file
    /// index.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Lowercased extension including the leading dot, e.g. `".pdf"`.
pub fn file_extension(filename: &str) -> Option<String> {
    let dot = filename.rfind('.')?;
    if dot + 1 >= filename.len() {
        return None;
    }
    Some(filename[dot..].to_ascii_lowercase())
}

pub fn is_archive(ext: &str) -> bool {
    ext == ".zip"
}

pub fn is_image(ext: &str) -> bool {
    matches!(ext, ".png" | ".jpg" | ".jpeg" | ".gif" | ".webp")
}

/// Extract text from an uploaded file. Images go through the vision call and
/// need the blob URL (or inline bytes when the blob backend is local); every
/// other format is handled in-process.
pub async fn extract(
    bytes: &[u8],
    filename: &str,
    mime_type: &str,
    blob_url: &str,
    llm: &GenAiClient,
) -> Result<Extraction> {
    let ext = file_extension(filename).unwrap_or_else(|| "(no extension)".to_string());
    match ext.as_str() {
        ".pdf" => extract_pdf(bytes),
        ".docx" => extract_docx(bytes),
        ".txt" | ".md" | ".markdown" | ".rtf" | ".csv" => {
            Ok(Extraction::single(String::from_utf8_lossy(bytes).into_owned()))
        }
        ".html" | ".htm" => Ok(Extraction::single(strip_html(&String::from_utf8_lossy(
            bytes,
        )))),
        ".eml" => extract_eml(bytes),
        ".msg" => extract_msg(bytes),
        ".zip" => Err(PipelineError::Extract(
            "archives are expanded by the job runner, not extracted".to_string(),
        )),
        _ if is_image(&ext) => extract_image(bytes, mime_type, blob_url, llm).await,
        _ => Err(PipelineError::UnsupportedFormat(ext)),
    }
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<Extraction> {
    if looks_encrypted(bytes) {
        return Err(PipelineError::EncryptedDocument);
    }
    let page_texts = pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| {
        let msg = e.to_string();
        if msg.to_ascii_lowercase().contains("encrypt") {
            PipelineError::EncryptedDocument
        } else {
            PipelineError::Extract(format!("PDF extraction failed: {msg}"))
        }
    })?;
    let pages = page_texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| PageText {
            page_number: Some(i as i64 + 1),
            text,
        })
        .collect();
    Ok(Extraction { pages })
}

/// Encrypted PDFs carry an /Encrypt entry in the trailer. Checked up front so
/// the failure is the distinct terminal error rather than a parse error.
fn looks_encrypted(bytes: &[u8]) -> bool {
    bytes.windows(8).any(|w| w == b"/Encrypt")
}

// ============ DOCX ============

fn extract_docx(bytes: &[u8]) -> Result<Extraction> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::Extract(format!("DOCX open failed: {e}")))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let text = docx_paragraph_text(&doc_xml)?;
    Ok(Extraction::single(text))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| PipelineError::Extract(format!("{name} not found: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::Extract(format!("read {name}: {e}")))?;
    if out.len() as u64 >= max_bytes {
        return Err(PipelineError::Extract(format!(
            "ZIP entry {name} exceeds size limit ({max_bytes} bytes)"
        )));
    }
    Ok(out)
}

/// Collect `w:t` run text, breaking lines at paragraph ends.
fn docx_paragraph_text(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    if !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::Extract(format!(
                    "DOCX XML parse failed: {e}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

// ============ HTML ============

/// Strip tags to readable text: comments and script/style bodies removed,
/// block-level tags become newlines, entities decoded, whitespace collapsed.
pub fn strip_html(html: &str) -> String {
    let mut out = String::new();
    let mut rest = html;
    loop {
        let Some(open) = rest.find('<') else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..open]);
        rest = &rest[open..];

        if rest.starts_with("<!--") {
            match rest.find("-->") {
                Some(end) => rest = &rest[end + 3..],
                None => break,
            }
            continue;
        }

        let Some(close) = rest.find('>') else { break };
        let tag_body = rest[1..close].trim();
        let is_closing = tag_body.starts_with('/');
        let tag_name: String = tag_body
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        rest = &rest[close + 1..];

        if !is_closing && matches!(tag_name.as_str(), "script" | "style") {
            let close_tag = format!("</{tag_name}");
            let lowered = rest.to_ascii_lowercase();
            match lowered.find(&close_tag) {
                Some(pos) => {
                    let after = rest[pos..]
                        .find('>')
                        .map(|q| pos + q + 1)
                        .unwrap_or(rest.len());
                    rest = &rest[after..];
                }
                None => break,
            }
            continue;
        }

        if matches!(
            tag_name.as_str(),
            "p" | "br"
                | "div"
                | "li"
                | "tr"
                | "ul"
                | "ol"
                | "table"
                | "blockquote"
                | "h1"
                | "h2"
                | "h3"
                | "h4"
                | "h5"
                | "h6"
        ) {
            out.push('\n');
        }
    }
    collapse_whitespace(&decode_entities(&out))
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest
            .char_indices()
            .take(12)
            .find(|&(_, c)| c == ';')
            .map(|(i, _)| i)
        else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..semi];
        let replacement = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match replacement {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn collapse_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let squeezed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if squeezed.is_empty() {
            if lines.last().map(|l| l.is_empty()) != Some(true) {
                lines.push(String::new());
            }
        } else {
            lines.push(squeezed);
        }
    }
    lines.join("\n").trim().to_string()
}

// ============ Email ============

fn extract_eml(bytes: &[u8]) -> Result<Extraction> {
    let raw = String::from_utf8_lossy(bytes);
    let (header_block, body) = split_message(&raw);
    let headers = parse_headers(header_block);

    let mut out = String::new();
    for key in ["subject", "from", "to", "date"] {
        if let Some(value) = headers.get(key) {
            let label = match key {
                "subject" => "Subject",
                "from" => "From",
                "to" => "To",
                _ => "Date",
            };
            out.push_str(&format!("{label}: {value}\n"));
        }
    }

    let body_text = decode_email_body(&headers, body);
    if !out.is_empty() && !body_text.trim().is_empty() {
        out.push('\n');
    }
    out.push_str(body_text.trim());
    Ok(Extraction::single(out))
}

fn split_message(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        (&raw[..pos], &raw[pos + 4..])
    } else if let Some(pos) = raw.find("\n\n") {
        (&raw[..pos], &raw[pos + 2..])
    } else {
        (raw, "")
    }
}

/// RFC 822 headers with continuation-line unfolding; keys lowercased.
fn parse_headers(block: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let mut current_key: Option<String> = None;
    for line in block.lines() {
        if (line.starts_with(' ') || line.starts_with('\t')) && current_key.is_some() {
            if let Some(key) = &current_key {
                if let Some(value) = headers.get_mut(key) {
                    let value: &mut String = value;
                    value.push(' ');
                    value.push_str(line.trim());
                }
            }
            continue;
        }
        let Some(colon) = line.find(':') else { continue };
        let key = line[..colon].trim().to_ascii_lowercase();
        let value = line[colon + 1..].trim().to_string();
        headers.insert(key.clone(), value);
        current_key = Some(key);
    }
    headers
}

/// Prefer a plain-text part; fall back to stripped HTML; fall back to the raw
/// body. Handles one level of multipart nesting, which covers typical mail.
fn decode_email_body(headers: &HashMap<String, String>, body: &str) -> String {
    let content_type = headers.get("content-type").cloned().unwrap_or_default();
    if content_type.to_ascii_lowercase().contains("multipart") {
        if let Some(boundary) = extract_boundary(&content_type) {
            let marker = format!("--{boundary}");
            let parts: Vec<&str> = body.split(marker.as_str()).collect();
            let mut html_fallback: Option<String> = None;
            for part in parts {
                let part = part.trim_start_matches(['\r', '\n']);
                if part.is_empty() || part.starts_with("--") {
                    continue;
                }
                let (part_headers_block, part_body) = split_message(part);
                let part_headers = parse_headers(part_headers_block);
                let part_type = part_headers
                    .get("content-type")
                    .cloned()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                let decoded = decode_transfer_encoding(&part_headers, part_body);
                if part_type.contains("text/plain") {
                    return decoded;
                }
                if part_type.contains("text/html") && html_fallback.is_none() {
                    html_fallback = Some(strip_html(&decoded));
                }
            }
            if let Some(html) = html_fallback {
                return html;
            }
        }
        return body.to_string();
    }

    let decoded = decode_transfer_encoding(headers, body);
    if content_type.to_ascii_lowercase().contains("text/html") {
        strip_html(&decoded)
    } else {
        decoded
    }
}

fn extract_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let pos = lower.find("boundary=")?;
    let after = &content_type[pos + "boundary=".len()..];
    let raw = after
        .split(|c| c == ';' || c == '\n')
        .next()
        .unwrap_or("")
        .trim();
    Some(raw.trim_matches('"').to_string())
}

fn decode_transfer_encoding(headers: &HashMap<String, String>, body: &str) -> String {
    let encoding = headers
        .get("content-transfer-encoding")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    match encoding.as_str() {
        "quoted-printable" => decode_quoted_printable(body),
        "base64" => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_else(|_| body.to_string())
        }
        _ => body.to_string(),
    }
}

fn decode_quoted_printable(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
                i += 2;
                continue;
            }
            if i + 2 < bytes.len() && bytes[i + 1] == b'\r' && bytes[i + 2] == b'\n' {
                i += 3;
                continue;
            }
            if i + 2 < bytes.len() {
                let hi = hex_value(bytes[i + 1]);
                let lo = hex_value(bytes[i + 2]);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push(hi * 16 + lo);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ============ Outlook .msg ============

/// Shortest text run worth keeping from a .msg container.
const MSG_MIN_RUN: usize = 6;
const MSG_MAX_RUNS: usize = 400;

/// Best-effort salvage from the CFB container: printable ASCII runs plus
/// UTF-16LE runs, which is where Outlook stores subject and body properties.
fn extract_msg(bytes: &[u8]) -> Result<Extraction> {
    let mut runs: Vec<String> = Vec::new();

    // ASCII runs
    let mut current = String::new();
    for &b in bytes {
        if (0x20..0x7f).contains(&b) {
            current.push(b as char);
        } else {
            push_run(&mut runs, &mut current);
        }
    }
    push_run(&mut runs, &mut current);

    // UTF-16LE runs; advance by one byte on mismatch to re-sync alignment
    let mut current = String::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let lo = bytes[i];
        let hi = bytes[i + 1];
        if hi == 0 && (0x20..0x7f).contains(&lo) {
            current.push(lo as char);
            i += 2;
        } else {
            push_run(&mut runs, &mut current);
            i += 1;
        }
    }
    push_run(&mut runs, &mut current);

    runs.dedup();
    runs.truncate(MSG_MAX_RUNS);
    if runs.is_empty() {
        return Err(PipelineError::Extract(
            "no readable text found in .msg file".to_string(),
        ));
    }
    Ok(Extraction::single(runs.join("\n")))
}

fn push_run(runs: &mut Vec<String>, current: &mut String) {
    if current.trim().len() >= MSG_MIN_RUN {
        runs.push(std::mem::take(current).trim().to_string());
    } else {
        current.clear();
    }
}

// ============ Images ============

async fn extract_image(
    bytes: &[u8],
    mime_type: &str,
    blob_url: &str,
    llm: &GenAiClient,
) -> Result<Extraction> {
    // Providers can't fetch local:// URLs; inline the bytes instead.
    let image_url = if BlobStore::is_local_url(blob_url) {
        format!(
            "data:{};base64,{}",
            mime_type,
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    } else {
        blob_url.to_string()
    };
    let text = llm.vision_extract(&image_url).await?;
    Ok(Extraction::single(text))
}
