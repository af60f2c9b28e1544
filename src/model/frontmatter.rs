//! Front-matter metadata extraction.
//!
//! Markdown files carry a `---` delimited front-matter block of simple
//! `key: value` pairs. `title` is required; a file without one is a
//! permanent validation failure and is never pushed. Everything else
//! is optional and forwarded to the remote store as-is.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Parsed front-matter fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMeta {
    /// Required document title.
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    /// Explicit collection override; wins over the path mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_doc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

/// A markdown file split into metadata and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub meta: DocMeta,
    /// Body with the front-matter block stripped.
    pub body: String,
}

/// Parse a markdown file into front matter and body.
///
/// `path` is used only for error context.
///
/// # Errors
///
/// Returns [`Error::MissingTitle`] when the file has no front-matter
/// block or the block lacks a non-empty `title:` field. This is a
/// permanent validation failure per the sync contract.
pub fn parse(path: &str, content: &str) -> Result<Document> {
    let Some((block, body)) = split_front_matter(content) else {
        return Err(Error::MissingTitle { path: path.to_string() });
    };

    let mut meta = DocMeta::default();
    for line in block.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = unquote(value.trim());
        if value.is_empty() {
            continue;
        }
        match key {
            "title" => meta.title = value.to_string(),
            "description" => meta.description = Some(value.to_string()),
            "category" => meta.category = Some(value.to_string()),
            "tags" => meta.tags = parse_tags(value),
            "collection" => meta.collection = Some(value.to_string()),
            "parent_doc" => meta.parent_doc = Some(value.to_string()),
            "outline_id" => meta.outline_id = Some(value.to_string()),
            "visibility" => meta.visibility = Some(value.to_string()),
            "author" => meta.author = Some(value.to_string()),
            "created" => meta.created = Some(value.to_string()),
            "modified" => meta.modified = Some(value.to_string()),
            // Unknown keys are tolerated, not round-tripped.
            _ => {}
        }
    }

    if meta.title.is_empty() {
        return Err(Error::MissingTitle { path: path.to_string() });
    }

    Ok(Document {
        meta,
        body: body.to_string(),
    })
}

/// Split `content` into (front-matter block, body).
///
/// Returns `None` when the file does not start with a `---` line or
/// the block is unterminated.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))?;

    // Find the closing delimiter on its own line.
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let block = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((block, body));
        }
        offset += line.len();
    }
    None
}

/// Parse a tags value: inline list `[a, b]` or comma-separated `a, b`.
fn parse_tags(value: &str) -> Vec<String> {
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value);
    inner
        .split(',')
        .map(|t| unquote(t.trim()).to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Strip one layer of matching single or double quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"'
            || bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
