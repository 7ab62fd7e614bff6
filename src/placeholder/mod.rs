//! Semantic-search placeholders
//!
//! The query synthesizer never writes vector comparisons itself. It emits
//! `PLACEHOLDER(kind, search text)` tokens that this module finds, embeds and rewrites into
//! pgvector distance predicates with bound parameters.

pub mod resolver;
pub mod scanner;

pub use resolver::PlaceholderResolver;
pub use scanner::scan;

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Marker identifier the language model is told to emit.
pub const PLACEHOLDER_MARKER: &str = "PLACEHOLDER";

/// Closed set of searchable dimensions, each backed by an embedding column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderKind {
    Category,
    Vendor,
    Item,
}

impl PlaceholderKind {
    pub const ALL: [PlaceholderKind; 3] = [
        PlaceholderKind::Category,
        PlaceholderKind::Vendor,
        PlaceholderKind::Item,
    ];

    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw
            .trim()
            .trim_matches(|c| c == '\'' || c == '"')
            .trim()
            .to_ascii_lowercase();
        match name.as_str() {
            "category" => Ok(PlaceholderKind::Category),
            "vendor" => Ok(PlaceholderKind::Vendor),
            "item" => Ok(PlaceholderKind::Item),
            _ => Err(PipelineError::PlaceholderParse(format!(
                "unknown placeholder kind '{}' (expected one of: category, vendor, item)",
                raw.trim()
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceholderKind::Category => "category",
            PlaceholderKind::Vendor => "vendor",
            PlaceholderKind::Item => "item",
        }
    }

    /// pgvector column compared against the search embedding.
    pub fn embedding_column(&self) -> &'static str {
        match self {
            PlaceholderKind::Category => "categoryEmbedding",
            PlaceholderKind::Vendor => "vendorEmbedding",
            PlaceholderKind::Item => "itemEmbedding",
        }
    }
}

impl fmt::Display for PlaceholderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `PLACEHOLDER(kind, text)` occurrence in a synthesized query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    /// Search text with everything except ASCII letters removed.
    pub search_text: String,
    /// Byte range of the whole token, marker through closing parenthesis.
    pub span: Range<usize>,
}

/// Strip every character that is not an ASCII letter.
///
/// Known limitation: spaces go too, so `"home office"` becomes `"homeoffice"`, and
/// non-English text loses its letters.
pub fn sanitize_search_text(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphabetic()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_is_case_insensitive_and_unquotes() {
        assert_eq!(PlaceholderKind::parse(" Category ").unwrap(), PlaceholderKind::Category);
        assert_eq!(PlaceholderKind::parse("'vendor'").unwrap(), PlaceholderKind::Vendor);
        assert_eq!(PlaceholderKind::parse("ITEM").unwrap(), PlaceholderKind::Item);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = PlaceholderKind::parse("brand").unwrap_err();
        assert!(matches!(err, PipelineError::PlaceholderParse(_)));
    }

    #[test]
    fn test_sanitize_drops_non_letters() {
        assert_eq!(sanitize_search_text(" electronics "), "electronics");
        assert_eq!(sanitize_search_text("McDonald's #12"), "McDonalds");
        assert_eq!(sanitize_search_text("home office"), "homeoffice");
        assert_eq!(sanitize_search_text("café"), "caf");
    }
}
