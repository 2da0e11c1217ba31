use crate::{PreviewError, Result};
use serde::{Deserialize, Serialize};

/// Preview choice from the client: zero-based index or exact title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    Index(usize),
    Title(String),
}

/// One selected preview, re-derived from a fresh file snapshot on every
/// rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewSpec {
    pub resolved_title: String,
    pub body_text: String,
    pub index: usize,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PreviewBlock {
    title: Option<String>,
    body: String,
}

/// Selects a preview from `contents`. No selector means the first preview.
pub fn select(contents: &str, selector: Option<&Selector>) -> Result<PreviewSpec> {
    let blocks = scan(contents);
    if blocks.is_empty() {
        return Err(PreviewError::NoPreviewFound);
    }
    let index = match selector {
        None => 0,
        Some(Selector::Index(k)) => {
            if *k >= blocks.len() {
                return Err(PreviewError::SelectorOutOfRange {
                    index: *k,
                    count: blocks.len(),
                });
            }
            *k
        }
        Some(Selector::Title(title)) => blocks
            .iter()
            .position(|b| b.title.as_deref() == Some(title.as_str()))
            .ok_or_else(|| PreviewError::SelectorNotFound(title.clone()))?,
    };
    Ok(PreviewSpec {
        resolved_title: blocks[index]
            .title
            .clone()
            .unwrap_or_else(|| format!("Preview {}", index + 1)),
        body_text: blocks[index].body.clone(),
        index,
        count: blocks.len(),
    })
}

/// Cycles to the next preview, wrapping past the last one.
pub fn next_preview(current_index: usize, count: usize) -> usize {
    (current_index + 1) % count
}

/// Collects `#Preview` blocks in source order. Blocks carrying a `traits:`
/// argument are not matched; trait variants are outside this scanner's
/// scope.
fn scan(contents: &str) -> Vec<PreviewBlock> {
    let bytes = contents.as_bytes();
    let mut blocks = Vec::new();
    let mut pos = 0;
    while let Some(offset) = contents[pos..].find("#Preview") {
        let start = pos + offset;
        let mut cursor = start + "#Preview".len();
        // The marker must stand alone, not be a prefix of a longer identifier.
        if bytes
            .get(cursor)
            .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            pos = cursor;
            continue;
        }
        cursor = skip_whitespace(contents, cursor);

        let mut title = None;
        let mut has_traits = false;
        if bytes.get(cursor) == Some(&b'(') {
            match matched_span(contents, cursor, b'(', b')') {
                Some(end) => {
                    let args = &contents[cursor + 1..end];
                    title = first_string_literal(args);
                    has_traits = args.contains("traits:");
                    cursor = skip_whitespace(contents, end + 1);
                }
                None => break,
            }
        }

        if bytes.get(cursor) != Some(&b'{') {
            pos = cursor;
            continue;
        }
        let Some(body_end) = matched_span(contents, cursor, b'{', b'}') else {
            break;
        };
        if !has_traits {
            blocks.push(PreviewBlock {
                title,
                body: contents[cursor + 1..body_end].trim().to_string(),
            });
        }
        pos = body_end + 1;
    }
    blocks
}

fn skip_whitespace(contents: &str, mut pos: usize) -> usize {
    let bytes = contents.as_bytes();
    while bytes.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
        pos += 1;
    }
    pos
}

/// Returns the index of the delimiter closing the one at `open_pos`,
/// skipping string literals and line comments.
fn matched_span(contents: &str, open_pos: usize, open: u8, close: u8) -> Option<usize> {
    let bytes = contents.as_bytes();
    debug_assert_eq!(bytes[open_pos], open);
    let mut depth = 0usize;
    let mut i = open_pos;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = skip_string_literal(bytes, i)?;
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Skips a `"…"` literal starting at `start`, honoring backslash escapes.
/// Returns the index just past the closing quote.
fn skip_string_literal(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn first_string_literal(args: &str) -> Option<String> {
    let bytes = args.as_bytes();
    let open = args.find('"')?;
    let end = skip_string_literal(bytes, open)?;
    Some(args[open + 1..end - 1].to_string())
}
