//! Sequence renumbering: reassign per-collection sequence numbers by creation
//! time without ever breaking live uniqueness, and carry every positional
//! reference along, all inside one immediate transaction.

mod error;
mod migrator;
mod plan;
mod references;

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::config::ToolConfig;
use crate::runtime::ResolvedPaths;
use crate::store::{ReferenceKind, open_store};

pub use error::RenumberError;
pub use plan::{Assignment, RenumberPlan, SnapshotRow, resolve_targets};
pub use references::PropagationCounts;

use error::StoreResultExt;

/// Boundaries inside one renumbering pass, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Begin,
    Precondition,
    Snapshot,
    Census,
    PhaseA,
    ReferenceFlip,
    PhaseB,
    ReferenceResolve,
    Verify,
    Commit,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Precondition => "precondition",
            Self::Snapshot => "snapshot",
            Self::Census => "census",
            Self::PhaseA => "phase_a",
            Self::ReferenceFlip => "reference_flip",
            Self::PhaseB => "phase_b",
            Self::ReferenceResolve => "reference_resolve",
            Self::Verify => "verify",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenumberStatus {
    Committed,
    Aborted,
}

impl RenumberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenumberOptions {
    pub collection_id: Option<i64>,
    pub dry_run: bool,
    pub verify: bool,
}

impl Default for RenumberOptions {
    fn default() -> Self {
        Self {
            collection_id: None,
            dry_run: false,
            verify: true,
        }
    }
}

impl RenumberOptions {
    pub fn from_config(config: &ToolConfig, collection_id: Option<i64>, dry_run: bool) -> Self {
        Self {
            collection_id,
            dry_run,
            verify: config.verify_renumber(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenumberReport {
    pub collection_filter: Option<i64>,
    pub dry_run: bool,
    pub collections_scanned: usize,
    pub documents_scanned: usize,
    pub collections_touched: usize,
    pub documents_moved: usize,
    pub reply_references_updated: usize,
    pub references_updated: BTreeMap<String, usize>,
    pub dangling_references: BTreeMap<String, usize>,
}

impl RenumberReport {
    fn new(options: &RenumberOptions) -> Self {
        Self {
            collection_filter: options.collection_id,
            dry_run: options.dry_run,
            collections_scanned: 0,
            documents_scanned: 0,
            collections_touched: 0,
            documents_moved: 0,
            reply_references_updated: 0,
            references_updated: BTreeMap::new(),
            dangling_references: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> RenumberStatus {
        if self.dry_run {
            RenumberStatus::Aborted
        } else {
            RenumberStatus::Committed
        }
    }
}

/// Open the project store and run one renumbering pass.
pub fn renumber_project(
    paths: &ResolvedPaths,
    config: &ToolConfig,
    options: &RenumberOptions,
) -> Result<RenumberReport> {
    let mut connection = open_store(paths, config)?.ok_or_else(|| {
        anyhow::anyhow!(
            "database at {} has no documents table; run `posttool db migrate`",
            paths.db_path.display()
        )
    })?;
    renumber(&mut connection, options).context("renumber aborted; no changes were committed")
}

/// Run one renumbering pass. Either every change commits or none does.
pub fn renumber(connection: &mut Connection, options: &RenumberOptions) -> Result<RenumberReport, RenumberError> {
    renumber_observed(connection, options, |_| Ok(()))
}

/// Like [`renumber`], calling `observer` after each completed stage. An observer
/// error rolls the whole pass back and surfaces as [`RenumberError::Interrupted`].
pub fn renumber_observed<F>(
    connection: &mut Connection,
    options: &RenumberOptions,
    mut observer: F,
) -> Result<RenumberReport, RenumberError>
where
    F: FnMut(Stage) -> Result<(), String>,
{
    let _span = info_span!("renumber", collection = ?options.collection_id, dry_run = options.dry_run).entered();
    let mut checkpoint = |stage: Stage| -> Result<(), RenumberError> {
        observer(stage).map_err(|reason| RenumberError::Interrupted { stage, reason })
    };

    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .at(Stage::Begin)?;
    let mut report = RenumberReport::new(options);

    check_preconditions(&transaction)?;
    checkpoint(Stage::Precondition)?;

    let snapshot = load_snapshot(&transaction, options.collection_id)?;
    let plan = resolve_targets(&snapshot);
    let staged = migrator::stage_plan(&transaction, &plan)?;
    report.collections_scanned = plan.collection_count();
    report.documents_scanned = plan.document_count();
    report.collections_touched = plan.touched_collections().len();
    debug!(
        documents = report.documents_scanned,
        moves = staged,
        "resolved target numbers"
    );
    checkpoint(Stage::Snapshot)?;

    let dangling = references::census_dangling(&transaction, options.collection_id)?;
    report.dangling_references = counts_by_name(&dangling);
    checkpoint(Stage::Census)?;

    if staged == 0 {
        debug!("every collection in scope is already in order");
    } else {
        migrator::park_moving_documents(&transaction, staged)?;
        checkpoint(Stage::PhaseA)?;

        let flipped = references::flip_pending_references(&transaction)?;
        checkpoint(Stage::ReferenceFlip)?;

        report.documents_moved = migrator::land_parked_documents(&transaction, staged)?;
        checkpoint(Stage::PhaseB)?;

        let resolved = references::resolve_pending_references(&transaction, &flipped)?;
        report.reply_references_updated = resolved.replies;
        report.references_updated = resolved
            .by_kind
            .iter()
            .map(|(kind, count)| (kind.as_str().to_string(), *count))
            .collect();
        checkpoint(Stage::ReferenceResolve)?;
    }

    if options.verify {
        verify_numbering(&transaction, &plan.touched_collections())?;
    }
    migrator::drop_plan(&transaction)?;
    checkpoint(Stage::Verify)?;

    if options.dry_run {
        transaction.rollback().at(Stage::Commit)?;
        info!(moved = report.documents_moved, "dry run rolled back");
    } else {
        transaction.commit().at(Stage::Commit)?;
        info!(
            collections = report.collections_touched,
            moved = report.documents_moved,
            replies = report.reply_references_updated,
            "renumber committed"
        );
    }
    Ok(report)
}

fn check_preconditions(connection: &Connection) -> Result<(), RenumberError> {
    let documents = count(
        connection,
        Stage::Precondition,
        "SELECT COUNT(*) FROM documents
         WHERE sequence_number < 0 OR reply_reference < 0 OR staged_number IS NOT NULL",
    )?;
    if documents > 0 {
        return Err(RenumberError::constraint(
            Stage::Precondition,
            format!("{documents} documents carry negative or staged sequence values"),
        ));
    }

    for kind in ReferenceKind::ALL {
        let negative = count(
            connection,
            Stage::Precondition,
            &format!("SELECT COUNT(*) FROM {} WHERE sequence_number < 0", kind.table()),
        )?;
        if negative > 0 {
            return Err(RenumberError::constraint(
                Stage::Precondition,
                format!("{negative} {} rows carry negative sequence numbers", kind.table()),
            ));
        }
    }
    Ok(())
}

fn load_snapshot(connection: &Connection, collection_id: Option<i64>) -> Result<Vec<SnapshotRow>, RenumberError> {
    let mut statement = connection
        .prepare(
            "SELECT id, collection_id, created_at_unix_ms, sequence_number
             FROM documents
             WHERE deleted_at_unix IS NULL
               AND (?1 IS NULL OR collection_id = ?1)",
        )
        .at(Stage::Snapshot)?;
    let rows = statement
        .query_map(params![collection_id], |row| {
            Ok(SnapshotRow {
                document_id: row.get(0)?,
                collection_id: row.get(1)?,
                ordering_key: row.get(2)?,
                sequence_number: row.get(3)?,
            })
        })
        .at(Stage::Snapshot)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().at(Stage::Snapshot)
}

fn verify_numbering(connection: &Connection, touched: &[i64]) -> Result<(), RenumberError> {
    check_preconditions(connection).map_err(|error| match error {
        RenumberError::ConstraintViolation { message, .. } => {
            RenumberError::constraint(Stage::Verify, format!("left behind: {message}"))
        }
        other => other,
    })?;

    let mut statement = connection
        .prepare(
            "SELECT COUNT(*), COUNT(DISTINCT sequence_number), MIN(sequence_number), MAX(sequence_number)
             FROM documents
             WHERE collection_id = ?1 AND deleted_at_unix IS NULL",
        )
        .at(Stage::Verify)?;
    for collection_id in touched {
        let (total, distinct, min, max): (i64, i64, i64, i64) = statement
            .query_row([collection_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .at(Stage::Verify)?;
        if total != distinct || min != 1 || max != total {
            warn!(collection_id, total, distinct, min, max, "collection is not densely numbered");
            return Err(RenumberError::constraint(
                Stage::Verify,
                format!("collection {collection_id} is not numbered 1..{total}"),
            ));
        }
    }
    Ok(())
}

fn count(connection: &Connection, stage: Stage, sql: &str) -> Result<i64, RenumberError> {
    connection.query_row(sql, [], |row| row.get(0)).at(stage)
}

fn counts_by_name(counts: &PropagationCounts) -> BTreeMap<String, usize> {
    let mut out: BTreeMap<String, usize> = counts
        .by_kind
        .iter()
        .map(|(kind, count)| (kind.as_str().to_string(), *count))
        .collect();
    out.insert("reply_reference".to_string(), counts.replies);
    out
}

#[cfg(test)]
mod tests;
