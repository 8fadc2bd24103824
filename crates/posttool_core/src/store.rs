use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::config::ToolConfig;
use crate::runtime::ResolvedPaths;

/// A post-like row. `sequence_number` is unique per collection among live rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub id: i64,
    pub collection_id: i64,
    pub created_at_unix_ms: i64,
    pub sequence_number: i64,
    pub reply_reference: Option<i64>,
    pub content: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub collection_id: i64,
    pub created_at_unix_ms: i64,
    pub sequence_number: i64,
    pub reply_reference: Option<i64>,
    pub content: String,
}

/// Record types that point at a document by `(collection_id, sequence_number)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    DeliveryMarker,
    ReadMarker,
    HighWaterMark,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 3] = [
        ReferenceKind::DeliveryMarker,
        ReferenceKind::ReadMarker,
        ReferenceKind::HighWaterMark,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Self::DeliveryMarker => "delivery_markers",
            Self::ReadMarker => "read_markers",
            Self::HighWaterMark => "high_water_marks",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeliveryMarker => "delivery_marker",
            Self::ReadMarker => "read_marker",
            Self::HighWaterMark => "high_water_mark",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceRecord {
    pub kind: ReferenceKind,
    pub user_id: i64,
    pub collection_id: i64,
    pub sequence_number: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub live_documents: usize,
    pub collections: usize,
    pub references: BTreeMap<String, usize>,
}

pub fn open_connection(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let connection =
        Connection::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(busy_timeout)
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

/// Open the project database. Returns `None` when it has not been created yet.
pub fn open_store(paths: &ResolvedPaths, config: &ToolConfig) -> Result<Option<Connection>> {
    if !paths.db_path.exists() {
        return Ok(None);
    }
    let connection = open_connection(&paths.db_path, config.busy_timeout())?;
    if !table_exists(&connection, "documents")? {
        return Ok(None);
    }
    Ok(Some(connection))
}

pub fn insert_document(connection: &Connection, document: &NewDocument) -> Result<i64> {
    connection
        .execute(
            "INSERT INTO documents (
                collection_id,
                created_at_unix_ms,
                sequence_number,
                reply_reference,
                content
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                document.collection_id,
                document.created_at_unix_ms,
                document.sequence_number,
                document.reply_reference,
                document.content,
            ],
        )
        .with_context(|| {
            format!(
                "failed to insert document {}#{}",
                document.collection_id, document.sequence_number
            )
        })?;
    Ok(connection.last_insert_rowid())
}

pub fn soft_delete_document(connection: &Connection, document_id: i64, at_unix: i64) -> Result<bool> {
    let updated = connection
        .execute(
            "UPDATE documents SET deleted_at_unix = ?2 WHERE id = ?1 AND deleted_at_unix IS NULL",
            params![document_id, at_unix],
        )
        .with_context(|| format!("failed to delete document {document_id}"))?;
    Ok(updated == 1)
}

pub fn load_document(connection: &Connection, document_id: i64) -> Result<Option<Document>> {
    connection
        .query_row(
            &format!("{DOCUMENT_SELECT} WHERE id = ?1"),
            [document_id],
            map_document,
        )
        .optional()
        .with_context(|| format!("failed to load document {document_id}"))
}

/// Documents ordered by collection then sequence number.
pub fn load_documents(
    connection: &Connection,
    collection_id: Option<i64>,
    include_deleted: bool,
) -> Result<Vec<Document>> {
    let mut statement = connection
        .prepare(&format!(
            "{DOCUMENT_SELECT}
             WHERE (?1 IS NULL OR collection_id = ?1)
               AND (?2 = 1 OR deleted_at_unix IS NULL)
             ORDER BY collection_id, sequence_number, id"
        ))
        .context("failed to prepare document query")?;
    let rows = statement
        .query_map(
            params![collection_id, if include_deleted { 1i64 } else { 0i64 }],
            map_document,
        )
        .context("failed to query documents")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode document row")?);
    }
    Ok(out)
}

pub fn update_document_content(connection: &Connection, document_id: i64, content: &str) -> Result<()> {
    let updated = connection
        .execute(
            "UPDATE documents SET content = ?2 WHERE id = ?1",
            params![document_id, content],
        )
        .with_context(|| format!("failed to update content of document {document_id}"))?;
    if updated != 1 {
        anyhow::bail!("document {document_id} does not exist");
    }
    Ok(())
}

pub fn insert_reference(connection: &Connection, record: &ReferenceRecord) -> Result<()> {
    connection
        .execute(
            &format!(
                "INSERT INTO {} (user_id, collection_id, sequence_number) VALUES (?1, ?2, ?3)",
                record.kind.table()
            ),
            params![record.user_id, record.collection_id, record.sequence_number],
        )
        .with_context(|| {
            format!(
                "failed to insert {} for user {}",
                record.kind.as_str(),
                record.user_id
            )
        })?;
    Ok(())
}

pub fn load_references(
    connection: &Connection,
    kind: ReferenceKind,
    collection_id: Option<i64>,
) -> Result<Vec<ReferenceRecord>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT user_id, collection_id, sequence_number FROM {}
             WHERE (?1 IS NULL OR collection_id = ?1)
             ORDER BY collection_id, user_id, rowid",
            kind.table()
        ))
        .with_context(|| format!("failed to prepare {} query", kind.as_str()))?;
    let rows = statement
        .query_map([collection_id], |row| {
            Ok(ReferenceRecord {
                kind,
                user_id: row.get(0)?,
                collection_id: row.get(1)?,
                sequence_number: row.get(2)?,
            })
        })
        .with_context(|| format!("failed to query {}", kind.as_str()))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.with_context(|| format!("failed to decode {} row", kind.as_str()))?);
    }
    Ok(out)
}

pub fn store_stats(connection: &Connection) -> Result<StoreStats> {
    let documents = count_query(connection, "SELECT COUNT(*) FROM documents")
        .context("failed to count documents")?;
    let live_documents = count_query(
        connection,
        "SELECT COUNT(*) FROM documents WHERE deleted_at_unix IS NULL",
    )
    .context("failed to count live documents")?;
    let collections = count_query(
        connection,
        "SELECT COUNT(DISTINCT collection_id) FROM documents",
    )
    .context("failed to count collections")?;

    let mut references = BTreeMap::new();
    for kind in ReferenceKind::ALL {
        let count = count_query(connection, &format!("SELECT COUNT(*) FROM {}", kind.table()))
            .with_context(|| format!("failed to count {}", kind.as_str()))?;
        references.insert(kind.as_str().to_string(), count);
    }

    Ok(StoreStats {
        documents,
        live_documents,
        collections,
        references,
    })
}

pub fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

const DOCUMENT_SELECT: &str = "SELECT id, collection_id, created_at_unix_ms, sequence_number, reply_reference, content, deleted_at_unix IS NOT NULL FROM documents";

fn map_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        collection_id: row.get(1)?,
        created_at_unix_ms: row.get(2)?,
        sequence_number: row.get(3)?,
        reply_reference: row.get(4)?,
        content: row.get(5)?,
        deleted: row.get(6)?,
    })
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection.query_row(sql, [], |row| row.get(0))?;
    usize::try_from(count).context("count does not fit into usize")
}
