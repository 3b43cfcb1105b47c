//! Best-effort payload enrichment
//!
//! Metadata services are consulted in ascending priority order when a
//! workflow starts. Each may fill catalog fields that are still blank;
//! values already present are never overwritten.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::workflow::{is_blank, MediaPackage};

/// Error type for metadata lookups
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata unavailable: {0}")]
    Unavailable(String),

    #[error("malformed metadata: {0}")]
    Malformed(String),
}

/// Catalog fields a metadata service can supply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogMetadata {
    pub title: Option<String>,
    pub series: Option<String>,
    pub series_title: Option<String>,
    pub language: Option<String>,
    pub license: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

/// Source of catalog metadata for a media package
#[async_trait]
pub trait MetadataService: Send + Sync + 'static {
    /// Lower values are consulted first
    fn priority(&self) -> i32;

    /// Metadata for `mediapackage`, if this service knows it
    async fn metadata(
        &self,
        mediapackage: &MediaPackage,
    ) -> Result<Option<CatalogMetadata>, MetadataError>;
}

fn fill(target: &mut Option<String>, value: &Option<String>) {
    if is_blank(target) && !is_blank(value) {
        *target = value.clone();
    }
}

/// Fill blank catalog fields of `mediapackage` from the given services
///
/// Failures are logged and skipped.
pub async fn populate_metadata(
    mediapackage: &mut MediaPackage,
    services: &[Arc<dyn MetadataService>],
) {
    let mut ordered: Vec<_> = services.iter().collect();
    ordered.sort_by_key(|s| s.priority());

    for service in ordered {
        let metadata = match service.metadata(mediapackage).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => continue,
            Err(e) => {
                warn!(
                    mediapackage = %mediapackage.identifier,
                    priority = service.priority(),
                    "Unable to extract metadata: {}", e
                );
                continue;
            }
        };

        fill(&mut mediapackage.title, &metadata.title);
        fill(&mut mediapackage.series, &metadata.series);
        fill(&mut mediapackage.series_title, &metadata.series_title);
        fill(&mut mediapackage.language, &metadata.language);
        fill(&mut mediapackage.license, &metadata.license);
        if mediapackage.created.is_none() {
            mediapackage.created = metadata.created;
        }
    }

    debug!(mediapackage = %mediapackage.identifier, "Populated media package metadata");
}
