//! Leaf text-extraction utilities used by the read tools.
//!
//! Extraction is format-specific but always flattens to plain text; the
//! token estimate stays the fixed length/4 heuristic the thresholds were
//! tuned against.

use crate::error::{Result, ToolError};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;
use std::path::Path;

pub const WHITELISTED_EXTENSIONS: &[&str] = &["pdf", "txt", "docx", "py", "c", "ipynb"];

/// Cheap token proxy: content length divided by four. Deliberately not a
/// real tokenizer.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64) / 4
}

/// Lower-cased extension if it is in the allowed set.
pub fn whitelisted_extension(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if WHITELISTED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(ToolError::Unwhitelisted(format!(".{ext}")))
    }
}

/// Extract plain text from a whitelisted file.
pub fn extract_text(path: &Path) -> Result<String> {
    let ext = whitelisted_extension(path)?;
    match ext.as_str() {
        "pdf" => extract_pdf(path),
        "docx" => extract_docx(path),
        "ipynb" => extract_notebook(path),
        _ => Ok(std::fs::read_to_string(path)?),
    }
}

fn extract_pdf(path: &Path) -> Result<String> {
    pdf_extract::extract_text(path).map_err(|e| ToolError::Io(format!("pdf extraction: {e}")))
}

/// A `.docx` is a zip container; the document body lives in
/// `word/document.xml` with text runs in `<w:t>` elements and paragraph
/// boundaries at `</w:p>`.
fn extract_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ToolError::Io(format!("docx container: {e}")))?;
    let mut document = archive
        .by_name("word/document.xml")
        .map_err(|e| ToolError::Io(format!("docx document.xml: {e}")))?;
    let mut xml = String::new();
    document.read_to_string(&mut xml)?;

    let mut reader = Reader::from_str(&xml);
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text_run = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    if !current.is_empty() {
                        paragraphs.push(std::mem::take(&mut current));
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) if in_text_run => {
                let piece = t
                    .unescape()
                    .map_err(|e| ToolError::Io(format!("docx text run: {e}")))?;
                current.push_str(&piece);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ToolError::Io(format!("docx xml: {e}"))),
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}

/// Concatenate code and markdown cell sources from an nbformat notebook.
fn extract_notebook(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)?;
    let nb: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| ToolError::Io(format!("notebook json: {e}")))?;
    let cells = nb
        .get("cells")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ToolError::Io("notebook has no cells array".to_string()))?;

    let mut out = Vec::new();
    for cell in cells {
        let kind = cell.get("cell_type").and_then(|t| t.as_str()).unwrap_or("");
        if kind != "code" && kind != "markdown" {
            continue;
        }
        match cell.get("source") {
            Some(serde_json::Value::String(s)) => out.push(s.clone()),
            Some(serde_json::Value::Array(lines)) => {
                let joined: String = lines
                    .iter()
                    .filter_map(|l| l.as_str())
                    .collect::<Vec<_>>()
                    .concat();
                out.push(joined);
            }
            _ => {}
        }
    }
    Ok(out.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn token_estimate_is_length_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefg"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn extension_whitelist_is_case_insensitive() {
        assert!(whitelisted_extension(&PathBuf::from("a.TXT")).is_ok());
        assert!(whitelisted_extension(&PathBuf::from("a.py")).is_ok());
        let err = whitelisted_extension(&PathBuf::from("a.exe")).unwrap_err();
        assert!(matches!(err, ToolError::Unwhitelisted(_)));
        let err = whitelisted_extension(&PathBuf::from("Makefile")).unwrap_err();
        assert!(matches!(err, ToolError::Unwhitelisted(_)));
    }

    #[test]
    fn notebook_cells_are_concatenated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("demo.ipynb");
        std::fs::write(
            &path,
            r##"{
                "cells": [
                    {"cell_type": "markdown", "source": ["# Title\n", "intro"]},
                    {"cell_type": "code", "source": "print('hi')"},
                    {"cell_type": "raw", "source": "skipped"}
                ]
            }"##,
        )
        .unwrap();
        let text = extract_text(&path).unwrap();
        assert_eq!(text, "# Title\nintro\n\nprint('hi')");
    }

    #[test]
    fn plain_files_read_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("main.c");
        std::fs::write(&path, "int main(void) { return 0; }\n").unwrap();
        assert_eq!(extract_text(&path).unwrap(), "int main(void) { return 0; }\n");
    }
}
