use anyhow::{Context, Result};
use regex::Regex;
use rusqlite::Connection;

use crate::services::{MatchKind, TextRewriteService};
use crate::store::{Document, load_document, load_documents, update_document_content};

/// [`TextRewriteService`] over the local store. Only live documents match.
pub struct SqliteTextRewriter<'c> {
    connection: &'c Connection,
}

impl<'c> SqliteTextRewriter<'c> {
    pub fn new(connection: &'c Connection) -> Self {
        Self { connection }
    }

    fn find_literal(&self, pattern: &str) -> Result<Vec<Document>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT id FROM documents
                 WHERE deleted_at_unix IS NULL AND instr(content, ?1) > 0
                 ORDER BY collection_id, sequence_number",
            )
            .context("failed to prepare literal match query")?;
        let ids = statement
            .query_map([pattern], |row| row.get::<_, i64>(0))
            .context("failed to run literal match query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode literal match row")?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(document) = load_document(self.connection, id)? {
                out.push(document);
            }
        }
        Ok(out)
    }

    fn find_regex(&self, pattern: &str) -> Result<Vec<Document>> {
        let regex = Regex::new(pattern).with_context(|| format!("invalid regex `{pattern}`"))?;
        Ok(load_documents(self.connection, None, false)?
            .into_iter()
            .filter(|document| regex.is_match(&document.content))
            .collect())
    }
}

impl TextRewriteService for SqliteTextRewriter<'_> {
    fn find_matches(&mut self, pattern: &str, kind: MatchKind) -> Result<Vec<Document>> {
        match kind {
            MatchKind::Literal => self.find_literal(pattern),
            MatchKind::Regex => self.find_regex(pattern),
        }
    }

    fn apply_rewrite(&mut self, document: &Document, new_content: &str) -> Result<()> {
        update_document_content(self.connection, document.id, new_content).with_context(|| {
            format!(
                "failed to rewrite {}#{}",
                document.collection_id, document.sequence_number
            )
        })
    }
}
