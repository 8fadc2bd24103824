//! Keeps positional references attached to the document they denote.
//!
//! After Phase A a reference is flipped negative when its value equals the
//! absolute value of a parked (negative) live document in its collection. After
//! Phase B every still-negative reference is resolved through the plan's
//! `(collection_id, old_number) -> target_number` mapping. The sign marks a
//! reference as pending exactly once, so it can never be matched again against a
//! document that already landed on a number another document used to hold.

use std::collections::BTreeMap;

use rusqlite::{Connection, params};
use tracing::{debug, info};

use super::Stage;
use super::error::{RenumberError, StoreResultExt};
use crate::store::ReferenceKind;

/// Per-flavor counts, plus the self-referential `reply_reference` column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationCounts {
    pub replies: usize,
    pub by_kind: BTreeMap<ReferenceKind, usize>,
}

impl PropagationCounts {
    pub fn total(&self) -> usize {
        self.replies + self.by_kind.values().sum::<usize>()
    }
}

/// Count references in scope that match no live document. They are left untouched.
pub(crate) fn census_dangling(
    connection: &Connection,
    collection_id: Option<i64>,
) -> Result<PropagationCounts, RenumberError> {
    let mut counts = PropagationCounts::default();

    counts.replies = count(
        connection,
        "SELECT COUNT(*) FROM documents AS source
         WHERE source.reply_reference IS NOT NULL
           AND (?1 IS NULL OR source.collection_id = ?1)
           AND NOT EXISTS (
               SELECT 1 FROM documents AS target
               WHERE target.collection_id = source.collection_id
                 AND target.sequence_number = source.reply_reference
                 AND target.deleted_at_unix IS NULL
           )",
        collection_id,
    )?;

    for kind in ReferenceKind::ALL {
        let dangling = count(
            connection,
            &format!(
                "SELECT COUNT(*) FROM {table} AS source
                 WHERE (?1 IS NULL OR source.collection_id = ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM documents AS target
                       WHERE target.collection_id = source.collection_id
                         AND target.sequence_number = source.sequence_number
                         AND target.deleted_at_unix IS NULL
                   )",
                table = kind.table()
            ),
            collection_id,
        )?;
        counts.by_kind.insert(kind, dangling);
    }

    if counts.total() > 0 {
        info!(
            replies = counts.replies,
            delivery_markers = counts.by_kind.get(&ReferenceKind::DeliveryMarker).copied().unwrap_or(0),
            read_markers = counts.by_kind.get(&ReferenceKind::ReadMarker).copied().unwrap_or(0),
            high_water_marks = counts.by_kind.get(&ReferenceKind::HighWaterMark).copied().unwrap_or(0),
            "dangling references left as-is"
        );
    }
    Ok(counts)
}

/// Mark every reference to a parked document as pending by mirroring its sign.
pub(crate) fn flip_pending_references(connection: &Connection) -> Result<PropagationCounts, RenumberError> {
    let mut counts = PropagationCounts::default();

    counts.replies = connection
        .execute(
            "UPDATE documents
             SET reply_reference = -reply_reference
             WHERE reply_reference > 0
               AND EXISTS (
                   SELECT 1 FROM documents AS target
                   WHERE target.collection_id = documents.collection_id
                     AND target.sequence_number = -documents.reply_reference
                     AND target.deleted_at_unix IS NULL
               )",
            [],
        )
        .at(Stage::ReferenceFlip)?;

    for kind in ReferenceKind::ALL {
        let table = kind.table();
        let flipped = connection
            .execute(
                &format!(
                    "UPDATE {table}
                     SET sequence_number = -sequence_number
                     WHERE sequence_number > 0
                       AND EXISTS (
                           SELECT 1 FROM documents AS target
                           WHERE target.collection_id = {table}.collection_id
                             AND target.sequence_number = -{table}.sequence_number
                             AND target.deleted_at_unix IS NULL
                       )"
                ),
                [],
            )
            .at(Stage::ReferenceFlip)?;
        counts.by_kind.insert(kind, flipped);
    }

    debug!(pending = counts.total(), "flipped references to parked documents");
    Ok(counts)
}

/// Rewrite every pending reference to its document's landed number.
pub(crate) fn resolve_pending_references(
    connection: &Connection,
    flipped: &PropagationCounts,
) -> Result<PropagationCounts, RenumberError> {
    let mut counts = PropagationCounts::default();

    counts.replies = connection
        .execute(
            "UPDATE documents
             SET reply_reference = plan.target_number
             FROM temp.renumber_plan AS plan
             WHERE documents.reply_reference < 0
               AND plan.collection_id = documents.collection_id
               AND plan.old_number = -documents.reply_reference",
            [],
        )
        .at(Stage::ReferenceResolve)?;
    expect_resolved(Stage::ReferenceResolve, "reply_reference", flipped.replies, counts.replies)?;

    for kind in ReferenceKind::ALL {
        let table = kind.table();
        let resolved = connection
            .execute(
                &format!(
                    "UPDATE {table}
                     SET sequence_number = plan.target_number
                     FROM temp.renumber_plan AS plan
                     WHERE {table}.sequence_number < 0
                       AND plan.collection_id = {table}.collection_id
                       AND plan.old_number = -{table}.sequence_number"
                ),
                [],
            )
            .at(Stage::ReferenceResolve)?;
        let expected = flipped.by_kind.get(&kind).copied().unwrap_or(0);
        expect_resolved(Stage::ReferenceResolve, kind.as_str(), expected, resolved)?;
        counts.by_kind.insert(kind, resolved);
    }

    debug!(resolved = counts.total(), "resolved pending references");
    Ok(counts)
}

fn expect_resolved(stage: Stage, what: &str, expected: usize, actual: usize) -> Result<(), RenumberError> {
    if expected != actual {
        return Err(RenumberError::constraint(
            stage,
            format!("{what}: {expected} references were pending but {actual} resolved"),
        ));
    }
    Ok(())
}

fn count(connection: &Connection, sql: &str, collection_id: Option<i64>) -> Result<usize, RenumberError> {
    let value: i64 = connection
        .query_row(sql, params![collection_id], |row| row.get(0))
        .at(Stage::Census)?;
    Ok(usize::try_from(value).unwrap_or_default())
}
