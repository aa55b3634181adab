use chrono::{DateTime, Utc};
use scraper::{Html, Node, Selector};
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};
use crate::normalize::{hash_bytes, normalize};

/// Elements whose text never reaches the page reader
const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Elements that start a new line of text
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "tr", "td", "th", "dt", "dd", "table", "section", "article",
    "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "dl", "header", "footer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Html,
    Pdf,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Html => "html",
            DocumentKind::Pdf => "pdf",
        }
    }

    /// Guess the kind from a URL or path extension
    pub fn from_reference(reference: &str) -> Self {
        let path = reference.split(['?', '#']).next().unwrap_or(reference);
        if path.to_ascii_lowercase().ends_with(".pdf") {
            DocumentKind::Pdf
        } else {
            DocumentKind::Html
        }
    }
}

/// A fetched source document. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct RawDocument {
    source_url: String,
    kind: DocumentKind,
    content: Vec<u8>,
    content_hash: String,
    fetched_at: DateTime<Utc>,
}

impl RawDocument {
    pub fn new(source_url: impl Into<String>, kind: DocumentKind, content: Vec<u8>) -> Self {
        let content_hash = hash_bytes(&content);
        Self {
            source_url: source_url.into(),
            kind,
            content,
            content_hash,
            fetched_at: Utc::now(),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// SHA-256 hex digest of the content bytes
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Content decoded as UTF-8, lossy
    pub fn content_str(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Normalized text of the document
    pub fn text(&self) -> Result<String> {
        match self.kind {
            DocumentKind::Html => Ok(html_text(&self.content_str())),
            DocumentKind::Pdf => pdf_text(&self.content),
        }
    }

    /// First `h1`/`h2` heading, for HTML documents
    pub fn heading(&self) -> Option<String> {
        match self.kind {
            DocumentKind::Html => html_heading(&self.content_str()),
            DocumentKind::Pdf => None,
        }
    }
}

/// Visible text of an HTML page, one line per block element, normalized
pub fn html_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();

    for node in document.root_element().descendants() {
        match node.value() {
            Node::Element(element) if BLOCK_TAGS.contains(&element.name()) => text.push('\n'),
            Node::Text(fragment) => {
                let hidden = node.ancestors().any(|ancestor| {
                    ancestor
                        .value()
                        .as_element()
                        .is_some_and(|e| HIDDEN_TAGS.contains(&e.name()))
                });
                if !hidden {
                    text.push_str(fragment);
                }
            }
            _ => {}
        }
    }

    normalize(&text)
}

/// Text of the first `h1` or `h2` in document order
pub fn html_heading(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("h1, h2").ok()?;
    document
        .select(&selector)
        .map(|el| normalize(&el.text().collect::<Vec<_>>().join(" ")))
        .find(|heading| !heading.is_empty())
}

/// Text layer of a PDF, normalized. Scanned PDFs without text yield an empty string.
pub fn pdf_text(content: &[u8]) -> Result<String> {
    let raw = pdf_extract::extract_text_from_mem(content)
        .map_err(|e| HarvestError::PdfError(e.to_string()))?;
    Ok(normalize(&raw))
}
