//! MIME-dispatched conversion of fetched bytes to plain text.
//!
//! HTML is stripped of scripts and styles, JSON is flattened to its
//! text-valued leaves, XML is reduced to element text, and anything else
//! passes through lossily decoded. All outputs have whitespace collapsed.

use scraper::{Html, Node};
use serde_json::Value;

use crate::error::ParseError;

/// Convert raw bytes to plain text based on the declared content type.
pub fn parse_bytes(bytes: &[u8], content_type: &str) -> Result<String, ParseError> {
    let text = String::from_utf8_lossy(bytes);

    match essence(content_type).as_str() {
        "text/html" | "application/xhtml+xml" => Ok(parse_html(&text)),
        ct if ct == "application/json" || ct.ends_with("+json") => parse_json(&text),
        ct if ct == "text/xml" || ct == "application/xml" || ct.ends_with("+xml") => {
            parse_xml(&text)
        }
        _ => Ok(collapse_whitespace(&text)),
    }
}

/// Strip parameters (`; charset=utf-8`) and normalize case.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Extract visible text from HTML, skipping script/style/head content.
fn parse_html(html: &str) -> String {
    let document = Html::parse_document(html);

    let mut out = String::new();
    for node in document.tree.nodes() {
        if let Node::Text(text) = node.value() {
            let skipped = node.ancestors().any(|ancestor| match ancestor.value() {
                Node::Element(el) => matches!(
                    el.name(),
                    "script" | "style" | "noscript" | "head" | "template"
                ),
                _ => false,
            });
            if !skipped {
                out.push_str(text);
                out.push(' ');
            }
        }
    }

    collapse_whitespace(&out)
}

/// Flatten a JSON document to its string-valued leaves, one per line.
fn parse_json(text: &str) -> Result<String, ParseError> {
    let value: Value = serde_json::from_str(text)?;
    let mut leaves = Vec::new();
    collect_json_leaves(&value, &mut leaves);
    Ok(leaves.join("\n"))
}

fn collect_json_leaves(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if !s.trim().is_empty() {
                out.push(collapse_whitespace(s));
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_json_leaves(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_json_leaves(item, out);
            }
        }
        _ => {}
    }
}

/// Extract element text content from an XML document.
fn parse_xml(text: &str) -> Result<String, ParseError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(text);
    let mut parts: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                let unescaped = e.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                let trimmed = unescaped.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
            Ok(Event::CData(e)) => {
                let raw = String::from_utf8_lossy(&e.into_inner()).into_owned();
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::Xml(e.to_string())),
        }
    }

    Ok(collapse_whitespace(&parts.join(" ")))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
