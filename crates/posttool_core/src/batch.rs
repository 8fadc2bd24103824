//! Per-row batch drivers. A failing row is logged with its collection and
//! sequence number and the loop moves on; only setup errors abort a batch.

use std::collections::HashMap;

use anyhow::{Result, bail};
use regex::Regex;
use serde::Serialize;
use similar::TextDiff;
use tracing::{info, warn};

use crate::config::ToolConfig;
use crate::services::{
    MatchKind, RebakeOptions, RebakeService, TextRewriteService, UploadReconciler,
};
use crate::store::Document;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchFailure {
    pub document_id: i64,
    pub collection_id: i64,
    pub sequence_number: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub task: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            ..Self::default()
        }
    }

    fn record_failure(&mut self, document: &Document, error: &anyhow::Error) {
        let message = format!("{error:#}");
        warn!(
            task = %self.task,
            collection_id = document.collection_id,
            sequence_number = document.sequence_number,
            error = %message,
            "batch row failed"
        );
        self.failed += 1;
        self.failures.push(BatchFailure {
            document_id: document.id,
            collection_id: document.collection_id,
            sequence_number: document.sequence_number,
            message,
        });
    }

    fn tick(&self, progress_every: usize) {
        if self.attempted % progress_every == 0 {
            info!(
                task = %self.task,
                attempted = self.attempted,
                failed = self.failed,
                "batch progress"
            );
        }
    }
}

/// Re-render each document. Notifications are overridden for this batch only;
/// `base` is never mutated.
pub fn rebake_documents(
    documents: &[Document],
    service: &mut dyn RebakeService,
    base: RebakeOptions,
    config: &ToolConfig,
) -> BatchReport {
    let options = base.for_batch(config.suppress_notifications());
    let progress_every = config.progress_every();
    let mut report = BatchReport::new("rebake");

    for document in documents {
        report.attempted += 1;
        if document.deleted {
            report.skipped += 1;
            continue;
        }
        match service.rebake(document, &options) {
            Ok(()) => report.succeeded += 1,
            Err(error) => report.record_failure(document, &error),
        }
        report.tick(progress_every);
    }

    info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failed,
        "rebake finished"
    );
    report
}

#[derive(Debug, Clone)]
pub struct RewriteRequest {
    pub pattern: String,
    pub replacement: String,
    pub kind: MatchKind,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewritePreview {
    pub document_id: i64,
    pub collection_id: i64,
    pub sequence_number: i64,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteReport {
    pub pattern: String,
    pub kind: MatchKind,
    pub dry_run: bool,
    pub batch: BatchReport,
    pub previews: Vec<RewritePreview>,
}

enum Rewriter {
    Literal(String),
    Regex(Regex),
}

impl Rewriter {
    fn new(pattern: &str, kind: MatchKind) -> Result<Self> {
        if pattern.is_empty() {
            bail!("rewrite pattern must not be empty");
        }
        match kind {
            MatchKind::Literal => Ok(Self::Literal(pattern.to_string())),
            MatchKind::Regex => Regex::new(pattern)
                .map(Self::Regex)
                .map_err(|error| anyhow::anyhow!("invalid regex `{pattern}`: {error}")),
        }
    }

    fn apply(&self, content: &str, replacement: &str) -> String {
        match self {
            Self::Literal(pattern) => content.replace(pattern.as_str(), replacement),
            Self::Regex(regex) => regex.replace_all(content, replacement).into_owned(),
        }
    }
}

/// Find documents matching `request.pattern` and rewrite their content.
pub fn rewrite_matching(
    service: &mut dyn TextRewriteService,
    request: &RewriteRequest,
    config: &ToolConfig,
) -> Result<RewriteReport> {
    let rewriter = Rewriter::new(&request.pattern, request.kind)?;
    let matches = service.find_matches(&request.pattern, request.kind)?;
    let progress_every = config.progress_every();
    let mut batch = BatchReport::new("rewrite");
    let mut previews = Vec::new();

    for document in &matches {
        batch.attempted += 1;
        let rewritten = rewriter.apply(&document.content, &request.replacement);
        if rewritten == document.content {
            batch.skipped += 1;
            continue;
        }
        if request.dry_run {
            previews.push(RewritePreview {
                document_id: document.id,
                collection_id: document.collection_id,
                sequence_number: document.sequence_number,
                diff: render_diff(document, &rewritten),
            });
            batch.succeeded += 1;
            continue;
        }
        match service.apply_rewrite(document, &rewritten) {
            Ok(()) => batch.succeeded += 1,
            Err(error) => batch.record_failure(document, &error),
        }
        batch.tick(progress_every);
    }

    info!(
        kind = request.kind.as_str(),
        matched = matches.len(),
        rewritten = batch.succeeded,
        failed = batch.failed,
        dry_run = request.dry_run,
        "rewrite finished"
    );
    Ok(RewriteReport {
        pattern: request.pattern.clone(),
        kind: request.kind,
        dry_run: request.dry_run,
        batch,
        previews,
    })
}

/// Recreate every missing upload and point the owning document at its canonical URL.
pub fn remap_missing_uploads(
    reconciler: &mut dyn UploadReconciler,
    rewriter: &mut dyn TextRewriteService,
) -> Result<BatchReport> {
    let missing = reconciler.find_missing_references()?;
    let mut report = BatchReport::new("remap_uploads");
    // Several uploads can live in one document; later remaps build on earlier ones.
    let mut latest: HashMap<i64, String> = HashMap::new();

    for item in &missing {
        report.attempted += 1;
        let canonical_url = match reconciler.recreate(item) {
            Ok(Some(url)) => url,
            Ok(None) => {
                warn!(
                    collection_id = item.document.collection_id,
                    sequence_number = item.document.sequence_number,
                    stored_path = %item.stored_path,
                    "upload could not be recovered"
                );
                report.skipped += 1;
                continue;
            }
            Err(error) => {
                report.record_failure(&item.document, &error);
                continue;
            }
        };

        let current = latest
            .get(&item.document.id)
            .cloned()
            .unwrap_or_else(|| item.document.content.clone());
        let remapped = current.replace(item.source_url.as_str(), &canonical_url);
        if remapped == current {
            report.skipped += 1;
            continue;
        }
        match rewriter.apply_rewrite(&item.document, &remapped) {
            Ok(()) => {
                latest.insert(item.document.id, remapped);
                report.succeeded += 1;
            }
            Err(error) => report.record_failure(&item.document, &error),
        }
    }

    info!(
        missing = missing.len(),
        remapped = report.succeeded,
        failed = report.failed,
        "upload remap finished"
    );
    Ok(report)
}

fn render_diff(document: &Document, rewritten: &str) -> String {
    let label = format!("{}#{}", document.collection_id, document.sequence_number);
    TextDiff::from_lines(document.content.as_str(), rewritten)
        .unified_diff()
        .context_radius(2)
        .header(&label, &label)
        .to_string()
}
