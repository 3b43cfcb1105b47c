//! Media package payload
//!
//! The engine treats the element tree as opaque JSON. Only the catalog
//! fields used for enrichment and index queries are typed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload carried through a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPackage {
    pub identifier: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Series identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creators: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributors: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,

    /// Tracks, catalogs and attachments, untouched by the engine
    #[serde(default)]
    pub elements: serde_json::Value,
}

impl MediaPackage {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: None,
            series: None,
            series_title: None,
            language: None,
            license: None,
            created: None,
            creators: Vec::new(),
            contributors: Vec::new(),
            subjects: Vec::new(),
            elements: serde_json::Value::Null,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_series(mut self, id: impl Into<String>, title: impl Into<String>) -> Self {
        self.series = Some(id.into());
        self.series_title = Some(title.into());
        self
    }

    pub fn with_elements(mut self, elements: serde_json::Value) -> Self {
        self.elements = elements;
        self
    }
}

/// Treat empty or whitespace-only optional strings as absent
pub(crate) fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
