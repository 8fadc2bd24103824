use std::time::Duration;

use rusqlite::Connection;
use tempfile::tempdir;

use super::*;
use crate::migrate::migrate_connection;
use crate::store::tests::memory_store;
use crate::store::{
    NewDocument, ReferenceRecord, insert_document, insert_reference, load_document,
    load_documents, load_references, open_connection, soft_delete_document,
};

fn doc(connection: &Connection, collection_id: i64, created: i64, number: i64, reply: Option<i64>) -> i64 {
    insert_document(
        connection,
        &NewDocument {
            collection_id,
            created_at_unix_ms: created,
            sequence_number: number,
            reply_reference: reply,
            content: format!("post created at {created}"),
        },
    )
    .expect("insert document")
}

fn reference(connection: &Connection, kind: ReferenceKind, user_id: i64, collection_id: i64, number: i64) {
    insert_reference(
        connection,
        &ReferenceRecord {
            kind,
            user_id,
            collection_id,
            sequence_number: number,
        },
    )
    .expect("insert reference");
}

fn number_of(connection: &Connection, document_id: i64) -> i64 {
    load_document(connection, document_id)
        .expect("load")
        .expect("document exists")
        .sequence_number
}

fn reply_of(connection: &Connection, document_id: i64) -> Option<i64> {
    load_document(connection, document_id)
        .expect("load")
        .expect("document exists")
        .reply_reference
}

fn references_of(connection: &Connection, kind: ReferenceKind, collection_id: i64) -> Vec<(i64, i64)> {
    load_references(connection, kind, Some(collection_id))
        .expect("load references")
        .into_iter()
        .map(|r| (r.user_id, r.sequence_number))
        .collect()
}

/// Every document, deleted or not, with its number and reply, plus every reference row.
fn full_state(connection: &Connection) -> (Vec<(i64, i64, Option<i64>)>, Vec<(i64, i64, i64)>) {
    let documents = load_documents(connection, None, true)
        .expect("load")
        .into_iter()
        .map(|d| (d.id, d.sequence_number, d.reply_reference))
        .collect();
    let references = ReferenceKind::ALL
        .iter()
        .flat_map(|kind| load_references(connection, *kind, None).expect("load references"))
        .map(|r| (r.user_id, r.collection_id, r.sequence_number))
        .collect();
    (documents, references)
}

/// Collection with (t1,3), (t2,1), (t3,2); t3 replies to #3; a delivery marker on #1.
fn worked_example(connection: &Connection) -> (i64, i64, i64) {
    let t1 = doc(connection, 1, 100, 3, None);
    let t2 = doc(connection, 1, 200, 1, None);
    let t3 = doc(connection, 1, 300, 2, Some(3));
    reference(connection, ReferenceKind::DeliveryMarker, 42, 1, 1);
    (t1, t2, t3)
}

#[test]
fn worked_example_renumbers_and_carries_references() {
    let mut connection = memory_store();
    let (t1, t2, t3) = worked_example(&connection);

    let report = renumber(&mut connection, &RenumberOptions::default()).expect("renumber");

    assert_eq!(number_of(&connection, t1), 1);
    assert_eq!(number_of(&connection, t2), 2);
    assert_eq!(number_of(&connection, t3), 3);
    assert_eq!(reply_of(&connection, t3), Some(1));
    assert_eq!(
        references_of(&connection, ReferenceKind::DeliveryMarker, 1),
        vec![(42, 2)]
    );

    assert_eq!(report.status(), RenumberStatus::Committed);
    assert_eq!(report.documents_moved, 3);
    assert_eq!(report.collections_touched, 1);
    assert_eq!(report.reply_references_updated, 1);
    assert_eq!(report.references_updated.get("delivery_marker"), Some(&1));
}

#[test]
fn all_reference_flavors_follow_their_document() {
    let mut connection = memory_store();
    // created order: a, b, c, d; stored order: d=1, c=2, b=3, a=4
    let a = doc(&connection, 9, 10, 4, None);
    let b = doc(&connection, 9, 20, 3, Some(4));
    let c = doc(&connection, 9, 30, 2, Some(3));
    let d = doc(&connection, 9, 40, 1, Some(2));
    reference(&connection, ReferenceKind::DeliveryMarker, 1, 9, 4);
    reference(&connection, ReferenceKind::DeliveryMarker, 1, 9, 1);
    reference(&connection, ReferenceKind::ReadMarker, 1, 9, 2);
    reference(&connection, ReferenceKind::HighWaterMark, 1, 9, 1);
    reference(&connection, ReferenceKind::HighWaterMark, 2, 9, 3);

    renumber(&mut connection, &RenumberOptions::default()).expect("renumber");

    assert_eq!(
        [a, b, c, d].map(|id| number_of(&connection, id)),
        [1, 2, 3, 4]
    );
    assert_eq!(reply_of(&connection, b), Some(1));
    assert_eq!(reply_of(&connection, c), Some(2));
    assert_eq!(reply_of(&connection, d), Some(3));
    assert_eq!(
        references_of(&connection, ReferenceKind::DeliveryMarker, 9),
        vec![(1, 1), (1, 4)]
    );
    assert_eq!(references_of(&connection, ReferenceKind::ReadMarker, 9), vec![(1, 3)]);
    assert_eq!(
        references_of(&connection, ReferenceKind::HighWaterMark, 9),
        vec![(1, 4), (2, 2)]
    );
}

#[test]
fn renumbered_collection_is_dense_and_ordered() {
    let mut connection = memory_store();
    let created = [70, 10, 50, 30, 60, 20, 40];
    for (index, created_at) in created.iter().enumerate() {
        let number = i64::try_from(index).expect("index") * 3 + 5;
        doc(&connection, 4, *created_at, number, None);
    }

    renumber(&mut connection, &RenumberOptions::default()).expect("renumber");

    let documents = load_documents(&connection, Some(4), false).expect("load");
    let numbers: Vec<i64> = documents.iter().map(|d| d.sequence_number).collect();
    assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
    let keys: Vec<i64> = documents.iter().map(|d| d.created_at_unix_ms).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

#[test]
fn equal_timestamps_keep_previous_relative_order() {
    let mut connection = memory_store();
    let late = doc(&connection, 1, 500, 1, None);
    let tie_high = doc(&connection, 1, 100, 8, None);
    let tie_low = doc(&connection, 1, 100, 6, None);

    renumber(&mut connection, &RenumberOptions::default()).expect("renumber");

    assert_eq!(number_of(&connection, tie_low), 1);
    assert_eq!(number_of(&connection, tie_high), 2);
    assert_eq!(number_of(&connection, late), 3);
}

#[test]
fn dangling_references_are_left_unchanged() {
    let mut connection = memory_store();
    let first = doc(&connection, 1, 20, 1, Some(77));
    let second = doc(&connection, 1, 10, 2, None);
    reference(&connection, ReferenceKind::ReadMarker, 5, 1, 99);
    reference(&connection, ReferenceKind::HighWaterMark, 5, 1, 2);

    let report = renumber(&mut connection, &RenumberOptions::default()).expect("renumber");

    assert_eq!(number_of(&connection, first), 2);
    assert_eq!(number_of(&connection, second), 1);
    assert_eq!(reply_of(&connection, first), Some(77));
    assert_eq!(references_of(&connection, ReferenceKind::ReadMarker, 1), vec![(5, 99)]);
    assert_eq!(references_of(&connection, ReferenceKind::HighWaterMark, 1), vec![(5, 1)]);
    assert_eq!(report.dangling_references.get("reply_reference"), Some(&1));
    assert_eq!(report.dangling_references.get("read_marker"), Some(&1));
    assert_eq!(report.dangling_references.get("high_water_mark"), Some(&0));
}

#[test]
fn dangling_value_colliding_with_a_new_number_is_not_remapped() {
    // #5 moves to #3; a marker on the unused #3 must stay put rather than follow #5.
    let mut connection = memory_store();
    doc(&connection, 1, 10, 1, None);
    doc(&connection, 1, 20, 2, None);
    let moved = doc(&connection, 1, 30, 5, None);
    reference(&connection, ReferenceKind::DeliveryMarker, 1, 1, 3);
    reference(&connection, ReferenceKind::DeliveryMarker, 2, 1, 5);

    renumber(&mut connection, &RenumberOptions::default()).expect("renumber");

    assert_eq!(number_of(&connection, moved), 3);
    assert_eq!(
        references_of(&connection, ReferenceKind::DeliveryMarker, 1),
        vec![(1, 3), (2, 3)]
    );
}

#[test]
fn second_run_changes_nothing() {
    let mut connection = memory_store();
    worked_example(&connection);
    renumber(&mut connection, &RenumberOptions::default()).expect("first run");
    let after_first = full_state(&connection);

    let report = renumber(&mut connection, &RenumberOptions::default()).expect("second run");

    assert_eq!(report.documents_moved, 0);
    assert_eq!(report.collections_touched, 0);
    assert_eq!(report.documents_scanned, 3);
    assert!(report.references_updated.is_empty());
    assert_eq!(full_state(&connection), after_first);
}

#[test]
fn collection_filter_leaves_other_collections_alone() {
    let mut connection = memory_store();
    let in_scope = doc(&connection, 1, 20, 1, None);
    doc(&connection, 1, 10, 2, None);
    let out_of_scope = doc(&connection, 2, 20, 1, None);
    doc(&connection, 2, 10, 2, None);
    reference(&connection, ReferenceKind::ReadMarker, 3, 2, 1);

    let report = renumber(
        &mut connection,
        &RenumberOptions {
            collection_id: Some(1),
            ..RenumberOptions::default()
        },
    )
    .expect("renumber");

    assert_eq!(report.collections_scanned, 1);
    assert_eq!(number_of(&connection, in_scope), 2);
    assert_eq!(number_of(&connection, out_of_scope), 1);
    assert_eq!(references_of(&connection, ReferenceKind::ReadMarker, 2), vec![(3, 1)]);
}

#[test]
fn deleted_documents_keep_their_number_but_their_replies_follow() {
    let mut connection = memory_store();
    let first = doc(&connection, 1, 20, 1, None);
    let second = doc(&connection, 1, 10, 2, None);
    let removed = doc(&connection, 1, 5, 3, Some(1));
    soft_delete_document(&connection, removed, 1_000).expect("delete");

    let report = renumber(&mut connection, &RenumberOptions::default()).expect("renumber");

    assert_eq!(report.documents_scanned, 2);
    assert_eq!(number_of(&connection, second), 1);
    assert_eq!(number_of(&connection, first), 2);
    assert_eq!(number_of(&connection, removed), 3);
    assert_eq!(reply_of(&connection, removed), Some(2));
}

#[test]
fn dry_run_reports_without_writing() {
    let mut connection = memory_store();
    worked_example(&connection);
    let before = full_state(&connection);

    let report = renumber(
        &mut connection,
        &RenumberOptions {
            dry_run: true,
            ..RenumberOptions::default()
        },
    )
    .expect("dry run");

    assert!(report.dry_run);
    assert_eq!(report.status(), RenumberStatus::Aborted);
    assert_eq!(report.documents_moved, 3);
    assert_eq!(report.reply_references_updated, 1);
    assert_eq!(full_state(&connection), before);
}

#[test]
fn negative_numbers_are_rejected_before_any_write() {
    let mut connection = memory_store();
    doc(&connection, 1, 20, 1, None);
    doc(&connection, 1, 10, 2, None);
    reference(&connection, ReferenceKind::DeliveryMarker, 1, 1, -2);
    let before = full_state(&connection);

    let error = renumber(&mut connection, &RenumberOptions::default()).expect_err("must fail");

    assert!(matches!(error, RenumberError::ConstraintViolation { .. }));
    assert_eq!(error.stage(), Stage::Precondition);
    assert_eq!(full_state(&connection), before);
}

#[test]
fn negative_document_numbers_are_rejected() {
    let mut connection = memory_store();
    doc(&connection, 1, 20, -1, None);
    doc(&connection, 1, 10, 2, None);

    let error = renumber(&mut connection, &RenumberOptions::default()).expect_err("must fail");
    assert!(matches!(
        error,
        RenumberError::ConstraintViolation {
            stage: Stage::Precondition,
            ..
        }
    ));
}

#[test]
fn interruption_after_phase_b_rolls_everything_back() {
    let mut connection = memory_store();
    worked_example(&connection);
    reference(&connection, ReferenceKind::ReadMarker, 7, 1, 3);
    let before = full_state(&connection);

    let mut seen = Vec::new();
    let error = renumber_observed(&mut connection, &RenumberOptions::default(), |stage| {
        seen.push(stage);
        if stage == Stage::PhaseB {
            Err("operator cancelled".to_string())
        } else {
            Ok(())
        }
    })
    .expect_err("must abort");

    assert!(matches!(error, RenumberError::Interrupted { stage: Stage::PhaseB, .. }));
    assert_eq!(
        seen,
        vec![
            Stage::Precondition,
            Stage::Snapshot,
            Stage::Census,
            Stage::PhaseA,
            Stage::ReferenceFlip,
            Stage::PhaseB,
        ]
    );
    assert_eq!(full_state(&connection), before);
}

#[test]
fn store_failure_inside_phase_b_rolls_everything_back() {
    let mut connection = memory_store();
    worked_example(&connection);
    connection
        .execute_batch(
            "CREATE TRIGGER fail_mid_phase_b
             BEFORE UPDATE OF sequence_number ON documents
             WHEN OLD.sequence_number < 0 AND NEW.sequence_number = 2
             BEGIN
                 SELECT RAISE(ABORT, 'injected storage failure');
             END;",
        )
        .expect("install trigger");
    let before = full_state(&connection);

    let error = renumber(&mut connection, &RenumberOptions::default()).expect_err("must abort");

    assert_eq!(error.stage(), Stage::PhaseB);
    assert!(error.to_string().contains("phase_b"));
    assert_eq!(full_state(&connection), before);

    connection
        .execute_batch("DROP TRIGGER fail_mid_phase_b")
        .expect("drop trigger");
    renumber(&mut connection, &RenumberOptions::default()).expect("retry succeeds");
    assert_eq!(
        references_of(&connection, ReferenceKind::DeliveryMarker, 1),
        vec![(42, 2)]
    );
}

#[test]
fn concurrent_readers_see_only_committed_numbers_and_writers_wait() {
    let temp = tempdir().expect("tempdir");
    let db_path = temp.path().join("posttool.db");
    let mut writer = open_connection(&db_path, Duration::from_secs(5)).expect("open writer");
    migrate_connection(&writer).expect("migrate");
    let (t1, t2, t3) = worked_example(&writer);

    let reader = open_connection(&db_path, Duration::ZERO).expect("open reader");
    let competitor = open_connection(&db_path, Duration::ZERO).expect("open competitor");
    let read_numbers = |connection: &Connection| -> Vec<i64> {
        [t1, t2, t3].iter().map(|id| number_of(connection, *id)).collect()
    };

    renumber_observed(&mut writer, &RenumberOptions::default(), |stage| {
        if matches!(stage, Stage::PhaseA | Stage::PhaseB) {
            assert_eq!(read_numbers(&reader), vec![3, 1, 2]);
            assert!(competitor.execute_batch("BEGIN IMMEDIATE").is_err());
        }
        Ok(())
    })
    .expect("renumber");

    assert_eq!(read_numbers(&reader), vec![1, 2, 3]);
}

#[test]
fn project_entry_point_requires_a_migrated_store() {
    let temp = tempdir().expect("tempdir");
    let paths = ResolvedPaths::for_project_root(temp.path());
    let error = renumber_project(&paths, &ToolConfig::default(), &RenumberOptions::default())
        .expect_err("must fail");
    assert!(error.to_string().contains("posttool db migrate"));
}
