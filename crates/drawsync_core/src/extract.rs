use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::DeflateDecoder;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::config::ParserKind;
use crate::error::PipelineError;

/// Pulls the human-readable labels out of a native diagram document.
///
/// Implementations return the fragments in document order. One implementation
/// is selected from configuration when the crawl starts.
pub trait DiagramParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract_text(&self, bytes: &[u8]) -> Result<Vec<String>, PipelineError>;
}

pub fn parser_for(kind: ParserKind) -> Box<dyn DiagramParser> {
    match kind {
        ParserKind::QuickXml => Box::new(QuickXmlParser),
    }
}

/// Concatenation stored as `extracted_text`.
pub fn join_fragments(fragments: &[String]) -> String {
    fragments.join(" ")
}

/// Streaming parser for the draw.io `mxfile` format, compressed or not.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuickXmlParser;

impl DiagramParser for QuickXmlParser {
    fn name(&self) -> &'static str {
        "quick-xml"
    }

    fn extract_text(&self, bytes: &[u8]) -> Result<Vec<String>, PipelineError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(malformed("document is empty"));
        }
        let xml = std::str::from_utf8(bytes)
            .map_err(|err| malformed(format!("document is not UTF-8: {err}")))?;
        let xml = xml.trim_start_matches('\u{feff}');

        let mut fragments = Vec::new();
        collect_fragments(xml, RootPolicy::FileOrModel, &mut fragments)?;
        Ok(fragments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootPolicy {
    FileOrModel,
    ModelOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    File,
    Model,
}

/// A `<diagram>` page of an mxfile while it is being read.
#[derive(Debug, Default)]
struct OpenPage {
    has_inline_model: bool,
    payload: String,
}

fn collect_fragments(
    xml: &str,
    policy: RootPolicy,
    fragments: &mut Vec<String>,
) -> Result<(), PipelineError> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut root = None;
    let mut page: Option<OpenPage> = None;

    loop {
        let event = reader.read_event().map_err(|err| {
            malformed(format!(
                "invalid XML near byte {}: {err}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(element) => {
                open_element(&element, depth, policy, &mut root, &mut page, fragments)?;
                depth += 1;
            }
            Event::Empty(element) => {
                open_element(&element, depth, policy, &mut root, &mut page, fragments)?;
                if depth == 1 && root == Some(Root::File) {
                    page = None;
                }
            }
            Event::End(element) => {
                if depth == 0 {
                    return Err(malformed("unbalanced closing tag"));
                }
                depth -= 1;
                if depth == 1
                    && root == Some(Root::File)
                    && element.name().as_ref() == b"diagram"
                    && let Some(closed) = page.take()
                {
                    close_page(closed, fragments)?;
                }
            }
            Event::Text(text) => {
                let raw = text
                    .unescape()
                    .map_err(|err| malformed(format!("invalid text content: {err}")))?;
                if depth == 0 {
                    if !raw.trim().is_empty() {
                        return Err(malformed("text outside of the root element"));
                    }
                } else if depth == 2
                    && let Some(open) = page.as_mut()
                {
                    open.payload.push_str(&raw);
                }
            }
            Event::CData(data) => {
                if depth == 2
                    && let Some(open) = page.as_mut()
                {
                    open.payload.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(malformed("document ended before all elements were closed"));
    }
    if root.is_none() {
        return Err(malformed("document has no root element"));
    }
    Ok(())
}

fn open_element(
    element: &BytesStart<'_>,
    depth: usize,
    policy: RootPolicy,
    root: &mut Option<Root>,
    page: &mut Option<OpenPage>,
    fragments: &mut Vec<String>,
) -> Result<(), PipelineError> {
    let name = element.name();
    let name = name.as_ref();

    if depth == 0 {
        if root.is_some() {
            return Err(malformed("document has more than one root element"));
        }
        *root = match (name, policy) {
            (b"mxfile", RootPolicy::FileOrModel) => Some(Root::File),
            (b"mxGraphModel", _) => Some(Root::Model),
            _ => {
                return Err(malformed(format!(
                    "unexpected root element <{}>",
                    String::from_utf8_lossy(name)
                )));
            }
        };
        return Ok(());
    }

    match name {
        b"diagram" if depth == 1 && *root == Some(Root::File) => {
            push_label(attribute(element, b"name")?, fragments);
            *page = Some(OpenPage::default());
        }
        b"mxGraphModel" if depth == 2 => {
            if let Some(open) = page.as_mut() {
                open.has_inline_model = true;
            }
        }
        b"mxCell" => push_label(attribute(element, b"value")?, fragments),
        b"UserObject" | b"object" => push_label(attribute(element, b"label")?, fragments),
        _ => {}
    }
    Ok(())
}

fn close_page(page: OpenPage, fragments: &mut Vec<String>) -> Result<(), PipelineError> {
    if page.has_inline_model || page.payload.trim().is_empty() {
        return Ok(());
    }
    let model = decode_compressed_page(&page.payload)?;
    collect_fragments(&model, RootPolicy::ModelOnly, fragments)
}

/// base64 -> raw deflate -> percent-decoding, the draw.io page compression.
fn decode_compressed_page(payload: &str) -> Result<String, PipelineError> {
    let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
    let deflated = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| malformed(format!("compressed page is not base64: {err}")))?;

    let mut inflated = String::new();
    DeflateDecoder::new(deflated.as_slice())
        .read_to_string(&mut inflated)
        .map_err(|err| malformed(format!("compressed page failed to inflate: {err}")))?;

    let decoded = urlencoding::decode(&inflated)
        .map_err(|err| malformed(format!("compressed page is not percent-encoded UTF-8: {err}")))?;
    Ok(decoded.into_owned())
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, PipelineError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|err| malformed(format!("invalid attribute: {err}")))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|err| malformed(format!("invalid attribute value: {err}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn push_label(raw: Option<String>, fragments: &mut Vec<String>) {
    if let Some(raw) = raw {
        let label = clean_label(&raw);
        if !label.is_empty() {
            fragments.push(label);
        }
    }
}

/// Labels may carry HTML; keep only the visible text. A `<` that does not
/// open a tag is label text.
fn clean_label(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let opens_tag = after
            .chars()
            .next()
            .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '/' || ch == '!');
        match after.find('>') {
            Some(end) if opens_tag => {
                text.push(' ');
                rest = &after[end + 1..];
            }
            _ => {
                text.push('<');
                rest = after;
            }
        }
    }
    text.push_str(rest);

    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn malformed(reason: impl Into<String>) -> PipelineError {
    PipelineError::MalformedDiagram(reason.into())
}
