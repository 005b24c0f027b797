//! JSONB document store.
//!
//! Documents live in one `documents` table keyed by `(collection, id)`.
//! Path operations are translated to `jsonb_set` and `#-` so a single
//! statement touches one nested value.

use crate::pool::{db_error, observe};
use certflow_core::error::{StoreError, StoreKind, WorkflowError};
use certflow_core::store::{DocumentOp, DocumentStore, DocumentTransaction};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use std::time::Duration;

const STORE: StoreKind = StoreKind::Document;

/// Document store backed by a `PostgreSQL` JSONB table.
#[derive(Clone, Debug)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    slow_threshold: Duration,
}

impl PostgresDocumentStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool, slow_threshold: Duration) -> Self {
        Self {
            pool,
            slow_threshold,
        }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open transaction on the `documents` table.
pub struct PostgresDocumentTx {
    tx: Transaction<'static, Postgres>,
    slow_threshold: Duration,
}

impl std::fmt::Debug for PostgresDocumentTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDocumentTx").finish_non_exhaustive()
    }
}

/// New `data` expression for a path operation; `$3` is the path and `$4`
/// the value. `None` for whole-document operations.
const fn update_expression(op: &DocumentOp) -> Option<&'static str> {
    match op {
        DocumentOp::Set { .. } => Some("jsonb_set(data, $3::text[], $4::jsonb, true)"),
        DocumentOp::SetIfAbsent { .. } => Some(
            "CASE WHEN COALESCE(data #> $3::text[], 'null'::jsonb) = 'null'::jsonb \
             THEN jsonb_set(data, $3::text[], $4::jsonb, true) ELSE data END",
        ),
        DocumentOp::Push { .. } => Some(
            "jsonb_set(data, $3::text[], \
             COALESCE(data #> $3::text[], '[]'::jsonb) || jsonb_build_array($4::jsonb), true)",
        ),
        DocumentOp::PopLast { .. } => Some("data #- ($3::text[] || ARRAY['-1'])"),
        DocumentOp::Unset { .. } => Some("data #- $3::text[]"),
        DocumentOp::Insert { .. } | DocumentOp::Delete { .. } => None,
    }
}

/// Escape `%`, `_` and `\` for an `ILIKE` pattern.
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl PostgresDocumentTx {
    async fn apply_op(&mut self, op: &DocumentOp) -> Result<(), StoreError> {
        let (collection, id) = op.target();

        match op {
            DocumentOp::Insert { document, .. } => {
                sqlx::query(
                    "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3)",
                )
                .bind(collection)
                .bind(id)
                .bind(document)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| db_error(STORE, "Failed to insert document", &e))?;
                return Ok(());
            }
            DocumentOp::Delete { .. } => {
                sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                    .bind(collection)
                    .bind(id)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| db_error(STORE, "Failed to delete document", &e))?;
                return Ok(());
            }
            _ => {}
        }

        let Some(expression) = update_expression(op) else {
            return Ok(());
        };
        let value = match op {
            DocumentOp::Set { value, .. }
            | DocumentOp::SetIfAbsent { value, .. }
            | DocumentOp::Push { value, .. } => value.clone(),
            _ => Value::Null,
        };

        let sql = format!(
            "UPDATE documents SET data = {expression}, revision = revision + 1, updated_at = NOW() \
             WHERE collection = $1 AND id = $2"
        );
        let result = sqlx::query(&sql)
            .bind(collection)
            .bind(id)
            .bind(op.path())
            .bind(value)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error(STORE, "Failed to update document", &e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::new(
                STORE,
                format!("document {collection}/{id} not found"),
            ));
        }
        Ok(())
    }
}

impl DocumentTransaction for PostgresDocumentTx {
    async fn apply(&mut self, op: &DocumentOp) -> Result<(), WorkflowError> {
        let threshold = self.slow_threshold;
        observe(STORE, threshold, || format!("{op:?}"), self.apply_op(op))
            .await
            .map_err(WorkflowError::from)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error(STORE, "Failed to commit", &e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| db_error(STORE, "Failed to roll back", &e))
    }
}

impl DocumentStore for PostgresDocumentStore {
    type Tx = PostgresDocumentTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error(STORE, "Failed to begin transaction", &e))?;
        Ok(PostgresDocumentTx {
            tx,
            slow_threshold: self.slow_threshold,
        })
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let sql = "SELECT data FROM documents WHERE collection = $1 AND id = $2";
        observe(
            STORE,
            self.slow_threshold,
            || sql.to_owned(),
            sqlx::query_scalar::<_, Value>(sql)
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|e| db_error(STORE, "Failed to fetch document", &e))
    }

    async fn search_text(&self, collection: &str, text: &str) -> Result<Vec<String>, StoreError> {
        let sql = r"SELECT id FROM documents
            WHERE collection = $1 AND data::text ILIKE $2 ESCAPE '\'
            ORDER BY id";
        observe(
            STORE,
            self.slow_threshold,
            || sql.to_owned(),
            sqlx::query_scalar::<_, String>(sql)
                .bind(collection)
                .bind(like_pattern(text))
                .fetch_all(&self.pool),
        )
        .await
        .map_err(|e| db_error(STORE, "Failed to search documents", &e))
    }
}
