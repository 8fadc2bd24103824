//! Narrow interfaces to the services batch tasks drive. Rendering, upload
//! storage and the like live behind these traits.

use anyhow::Result;
use serde::Serialize;

use crate::store::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebakeOptions {
    /// Drop any cached rendering before re-rendering.
    pub invalidate_cache: bool,
    /// Whether re-rendering may notify users mentioned in the content.
    pub notify_mentions: bool,
}

impl Default for RebakeOptions {
    fn default() -> Self {
        Self {
            invalidate_cache: true,
            notify_mentions: true,
        }
    }
}

impl RebakeOptions {
    /// Copy of these options with notifications forced off when `suppress` is set.
    pub fn for_batch(self, suppress_notifications: bool) -> Self {
        Self {
            notify_mentions: self.notify_mentions && !suppress_notifications,
            ..self
        }
    }
}

pub trait RebakeService {
    fn rebake(&mut self, document: &Document, options: &RebakeOptions) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Literal,
    Regex,
}

impl MatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Literal => "literal",
            Self::Regex => "regex",
        }
    }
}

pub trait TextRewriteService {
    fn find_matches(&mut self, pattern: &str, kind: MatchKind) -> Result<Vec<Document>>;
    fn apply_rewrite(&mut self, document: &Document, new_content: &str) -> Result<()>;
}

/// A document whose content links an upload the store no longer has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingUpload {
    pub document: Document,
    pub source_url: String,
    pub stored_path: String,
}

pub trait UploadReconciler {
    fn find_missing_references(&mut self) -> Result<Vec<MissingUpload>>;
    /// Recreate the canonical resource. `Ok(None)` means it cannot be recovered.
    fn recreate(&mut self, missing: &MissingUpload) -> Result<Option<String>>;
}
