//! Two-phase key migration over live storage.
//!
//! Phase A parks every moving document in the negative half of the integer
//! domain and records its target in `staged_number`. Phase B lands the parked
//! rows on their targets. Each phase is one set-based statement joined against
//! the connection-local `renumber_plan` table, so SQLite's row-by-row unique
//! check never sees two live rows sharing a number: negation is injective and
//! disjoint from the positive range, and every target reused in Phase B was
//! either vacated in Phase A or is unused.

use rusqlite::{Connection, params};
use tracing::debug;

use super::Stage;
use super::error::{RenumberError, StoreResultExt};
use super::plan::RenumberPlan;

const PLAN_SCHEMA_SQL: &str = r#"
CREATE TEMP TABLE IF NOT EXISTS renumber_plan (
    document_id INTEGER PRIMARY KEY,
    collection_id INTEGER NOT NULL,
    old_number INTEGER NOT NULL,
    target_number INTEGER NOT NULL,
    UNIQUE (collection_id, old_number)
);
DELETE FROM temp.renumber_plan;
"#;

/// Materialize the moves of `plan` into `temp.renumber_plan`. Returns the number staged.
pub(crate) fn stage_plan(connection: &Connection, plan: &RenumberPlan) -> Result<usize, RenumberError> {
    connection
        .execute_batch(PLAN_SCHEMA_SQL)
        .at(Stage::Snapshot)?;

    let mut statement = connection
        .prepare(
            "INSERT INTO temp.renumber_plan (document_id, collection_id, old_number, target_number)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .at(Stage::Snapshot)?;
    let mut staged = 0usize;
    for assignment in plan.moves() {
        statement
            .execute(params![
                assignment.document_id,
                assignment.collection_id,
                assignment.old_number,
                assignment.target_number,
            ])
            .at(Stage::Snapshot)?;
        staged += 1;
    }
    Ok(staged)
}

pub(crate) fn drop_plan(connection: &Connection) -> Result<(), RenumberError> {
    connection
        .execute_batch("DROP TABLE IF EXISTS temp.renumber_plan")
        .at(Stage::Verify)
}

/// Phase A: negate every moving document and stage its target.
pub(crate) fn park_moving_documents(connection: &Connection, expected: usize) -> Result<usize, RenumberError> {
    let parked = connection
        .execute(
            "UPDATE documents
             SET sequence_number = -documents.sequence_number,
                 staged_number = plan.target_number
             FROM temp.renumber_plan AS plan
             WHERE plan.document_id = documents.id
               AND documents.sequence_number = plan.old_number
               AND documents.deleted_at_unix IS NULL",
            [],
        )
        .at(Stage::PhaseA)?;
    if parked != expected {
        return Err(RenumberError::constraint(
            Stage::PhaseA,
            format!("expected to park {expected} documents, parked {parked}"),
        ));
    }
    debug!(parked, "phase A parked moving documents");
    Ok(parked)
}

/// Phase B: land every parked document on its staged target.
pub(crate) fn land_parked_documents(connection: &Connection, expected: usize) -> Result<usize, RenumberError> {
    let landed = connection
        .execute(
            "UPDATE documents
             SET sequence_number = staged_number,
                 staged_number = NULL
             WHERE sequence_number < 0
               AND staged_number IS NOT NULL",
            [],
        )
        .at(Stage::PhaseB)?;
    if landed != expected {
        return Err(RenumberError::constraint(
            Stage::PhaseB,
            format!("expected to land {expected} documents, landed {landed}"),
        ));
    }
    debug!(landed, "phase B landed parked documents");
    Ok(landed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renumber::plan::{SnapshotRow, resolve_targets};
    use crate::store::tests::memory_store;
    use crate::store::{NewDocument, insert_document, load_documents};

    fn seed(connection: &Connection, rows: &[(i64, i64)]) -> Vec<SnapshotRow> {
        rows.iter()
            .map(|&(ordering_key, sequence_number)| {
                let document_id = insert_document(
                    connection,
                    &NewDocument {
                        collection_id: 1,
                        created_at_unix_ms: ordering_key,
                        sequence_number,
                        ..NewDocument::default()
                    },
                )
                .expect("insert");
                SnapshotRow {
                    document_id,
                    collection_id: 1,
                    ordering_key,
                    sequence_number,
                }
            })
            .collect()
    }

    fn numbers(connection: &Connection) -> Vec<(i64, i64)> {
        load_documents(connection, Some(1), false)
            .expect("load")
            .into_iter()
            .map(|d| (d.created_at_unix_ms, d.sequence_number))
            .collect()
    }

    #[test]
    fn phase_a_negates_only_moving_documents() {
        let connection = memory_store();
        let snapshot = seed(&connection, &[(10, 2), (20, 1), (30, 3)]);
        let plan = resolve_targets(&snapshot);
        let staged = stage_plan(&connection, &plan).expect("stage");
        assert_eq!(staged, 2);

        park_moving_documents(&connection, staged).expect("phase A");
        let mut after = numbers(&connection);
        after.sort();
        assert_eq!(after, vec![(10, -2), (20, -1), (30, 3)]);
    }

    #[test]
    fn reversal_lands_under_live_unique_index() {
        let connection = memory_store();
        let snapshot = seed(&connection, &[(10, 5), (20, 4), (30, 3), (40, 2), (50, 1)]);
        let plan = resolve_targets(&snapshot);
        let staged = stage_plan(&connection, &plan).expect("stage");
        assert_eq!(staged, 4);

        park_moving_documents(&connection, staged).expect("phase A");
        land_parked_documents(&connection, staged).expect("phase B");
        let mut after = numbers(&connection);
        after.sort();
        assert_eq!(after, vec![(10, 1), (20, 2), (30, 3), (40, 4), (50, 5)]);
    }

    #[test]
    fn phase_a_rejects_a_stale_plan() {
        let connection = memory_store();
        let snapshot = seed(&connection, &[(10, 2), (20, 1)]);
        let plan = resolve_targets(&snapshot);
        let staged = stage_plan(&connection, &plan).expect("stage");
        connection
            .execute("UPDATE documents SET sequence_number = 7 WHERE sequence_number = 2", [])
            .expect("concurrent edit");

        let error = park_moving_documents(&connection, staged).expect_err("stale plan");
        assert!(matches!(error, RenumberError::ConstraintViolation { .. }));
    }
}
