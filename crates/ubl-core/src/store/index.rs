//! SQLite index store.
//!
//! A reader-side mirror written from multiple coordinators. All writes are
//! idempotent: span rows use `ON CONFLICT DO NOTHING` (an atom mirror is
//! immutable), agreements and summaries use `ON CONFLICT DO UPDATE` on
//! metadata. WAL mode allows concurrent reads while writes are in progress.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

use crate::agreement::Agreement;
use crate::atom::Atom;
use crate::tenant::RoomSummary;
use crate::workspace::Document;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from the index store.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored JSON column failed to parse.
    #[error("corrupt row in {table}: {message}")]
    Corrupt {
        /// Table the row came from.
        table: String,
        /// Parser diagnostic.
        message: String,
    },
}

/// One mirrored atom row.
#[derive(Debug, Clone)]
pub struct SpanRow {
    /// Row id, `span:<seq>`.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Acting user, absent on effects.
    pub user_id: Option<String>,
    /// Atom kind discriminator.
    pub kind: String,
    /// Content id.
    pub hash: String,
    /// Canonical serialized size in bytes.
    pub size: u64,
    /// Ledger sequence number.
    pub seq: u64,
    /// Head hash after the atom.
    pub head_hash: String,
    /// The full atom.
    pub atom: Atom,
}

impl SpanRow {
    /// Builds a span row from an appended atom.
    #[must_use]
    pub fn from_atom(atom: &Atom, seq: u64, head_hash: &str, size: u64) -> Self {
        Self {
            id: format!("span:{seq}"),
            tenant_id: atom.tenant_id().to_string(),
            user_id: atom.user_id().map(ToString::to_string),
            kind: atom.kind().to_string(),
            hash: atom.cid().unwrap_or_default().to_string(),
            size,
            seq,
            head_hash: head_hash.to_string(),
            atom: atom.clone(),
        }
    }
}

/// The tabular mirror store.
pub struct IndexStore {
    conn: Arc<Mutex<Connection>>,
}

impl IndexStore {
    /// Opens or creates the index store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory index store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The underlying connection, shared with [`super::SqliteStateStore`]
    /// when both stores live in one database file.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Mirrors an appended atom. Duplicate inserts are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn insert_span(&self, row: &SpanRow) -> Result<(), IndexError> {
        let metadata = serde_json::json!({
            "seq": row.seq,
            "head_hash": row.head_hash,
            "atom": row.atom,
        });
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO spans (id, tenant_id, user_id, kind, hash, size, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (tenant_id, id) DO NOTHING",
            params![
                row.id,
                row.tenant_id,
                row.user_id,
                row.kind,
                row.hash,
                row.size,
                metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Loads the span at `seq` for a tenant, if mirrored.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt metadata column.
    pub fn get_span(&self, tenant_id: &str, seq: u64) -> Result<Option<SpanRow>, IndexError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, tenant_id, user_id, kind, hash, size, metadata
                 FROM spans WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, format!("span:{seq}")],
                Self::row_to_span,
            )
            .optional()?;
        row.transpose().map_err(|e| IndexError::Corrupt {
            table: "spans".to_string(),
            message: e.to_string(),
        })
    }

    /// Loads up to `limit` spans with `seq < before`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt metadata column.
    pub fn spans_before(
        &self,
        tenant_id: &str,
        before: u64,
        limit: usize,
    ) -> Result<Vec<SpanRow>, IndexError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, user_id, kind, hash, size, metadata
             FROM spans
             WHERE tenant_id = ?1 AND CAST(json_extract(metadata, '$.seq') AS INTEGER) < ?2
             ORDER BY CAST(json_extract(metadata, '$.seq') AS INTEGER) DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![tenant_id, before, limit as u64],
            Self::row_to_span,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.map_err(|e| IndexError::Corrupt {
                table: "spans".to_string(),
                message: e.to_string(),
            })?);
        }
        Ok(out)
    }

    fn row_to_span(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<SpanRow, serde_json::Error>> {
        let id: String = row.get(0)?;
        let tenant_id: String = row.get(1)?;
        let user_id: Option<String> = row.get(2)?;
        let kind: String = row.get(3)?;
        let hash: String = row.get(4)?;
        let size: u64 = row.get(5)?;
        let metadata: String = row.get(6)?;
        Ok(parse_span_metadata(
            id, tenant_id, user_id, kind, hash, size, &metadata,
        ))
    }

    /// Upserts an agreement; metadata wins on conflict.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn upsert_agreement(&self, agreement: &Agreement) -> Result<(), IndexError> {
        let kind = serde_json::to_value(agreement.kind)
            .ok()
            .and_then(|v| v.as_str().map(ToString::to_string))
            .unwrap_or_default();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agreements (id, type, tenant_id, created_at, created_by, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET metadata = ?6",
            params![
                agreement.id,
                kind,
                agreement.tenant_id,
                agreement.created_at,
                agreement.created_by,
                agreement.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Loads an agreement by id.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt row.
    pub fn get_agreement(&self, id: &str) -> Result<Option<Agreement>, IndexError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String, String, String, String, String)> = conn
            .query_row(
                "SELECT id, type, tenant_id, created_at, created_by, metadata
                 FROM agreements WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, kind, tenant_id, created_at, created_by, metadata)) = row else {
            return Ok(None);
        };
        let kind = serde_json::from_value(serde_json::Value::String(kind)).map_err(|e| {
            IndexError::Corrupt {
                table: "agreements".to_string(),
                message: e.to_string(),
            }
        })?;
        let metadata = serde_json::from_str(&metadata).map_err(|e| IndexError::Corrupt {
            table: "agreements".to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(Agreement {
            id,
            kind,
            tenant_id,
            created_at,
            created_by,
            metadata,
        }))
    }

    /// Mirrors a tenant record.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn upsert_tenant(
        &self,
        tenant_id: &str,
        kind: &str,
        created_at: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), IndexError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tenants (id, type, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET metadata = ?4",
            params![tenant_id, kind, created_at, metadata.to_string()],
        )?;
        Ok(())
    }

    /// True when a tenant row exists.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn tenant_exists(&self, tenant_id: &str) -> Result<bool, IndexError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Mirrors a room summary.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn upsert_room(&self, tenant_id: &str, summary: &RoomSummary) -> Result<(), IndexError> {
        let mode = serde_json::to_value(summary.mode)
            .ok()
            .and_then(|v| v.as_str().map(ToString::to_string))
            .unwrap_or_default();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rooms (tenant_id, room_id, name, mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (tenant_id, room_id) DO NOTHING",
            params![
                tenant_id,
                summary.room_id,
                summary.name,
                mode,
                summary.created_at,
            ],
        )?;
        Ok(())
    }

    /// Mirrors a document row (bodies stay in the coordinator).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn upsert_document(&self, document: &Document) -> Result<(), IndexError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO documents
                 (tenant_id, workspace_id, document_id, title, content_hash, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (tenant_id, document_id) DO NOTHING",
            params![
                document.tenant_id,
                document.workspace_id,
                document.document_id,
                document.title,
                document.content_hash,
                document.created_by,
                document.created_at,
            ],
        )?;
        Ok(())
    }

    /// Appends an audit row.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn insert_audit(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        action: &str,
        request_id: Option<&str>,
        detail: &serde_json::Value,
    ) -> Result<(), IndexError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log (tenant_id, user_id, action, request_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tenant_id,
                user_id,
                action,
                request_id,
                detail.to_string(),
                crate::atom::now_iso(),
            ],
        )?;
        Ok(())
    }

    /// Number of mirrored spans for a tenant (test support).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn span_count(&self, tenant_id: &str) -> Result<u64, IndexError> {
        let conn = self.conn.lock().unwrap();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM spans WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn parse_span_metadata(
    id: String,
    tenant_id: String,
    user_id: Option<String>,
    kind: String,
    hash: String,
    size: u64,
    metadata: &str,
) -> Result<SpanRow, serde_json::Error> {
    #[derive(serde::Deserialize)]
    struct Meta {
        seq: u64,
        head_hash: String,
        atom: Atom,
    }
    let meta: Meta = serde_json::from_str(metadata)?;
    Ok(SpanRow {
        id,
        tenant_id,
        user_id,
        kind,
        hash,
        size,
        seq: meta.seq,
        head_hash: meta.head_hash,
        atom: meta.atom,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agreement::AgreementType;
    use crate::atom::{ActionAtom, ActionStatus, Actor, Did, Trace};

    fn sample_atom(cid: &str) -> Atom {
        Atom::Action(ActionAtom {
            tenant_id: "t:ex.com".into(),
            cid: Some(cid.into()),
            prev_hash: Some(crate::hash::GENESIS_HEAD.into()),
            when: "2026-01-01T00:00:00.000Z".into(),
            who: Actor {
                user_id: "u:alice".into(),
                email: "alice@ex.com".into(),
                is_service: None,
            },
            did: Did::MessengerSend,
            this: json!({"room_id": "r:general"}),
            agreement_id: Some("a:room:r:general".into()),
            status: ActionStatus::Executed,
            trace: Trace {
                request_id: "req:1".into(),
            },
        })
    }

    #[test]
    fn span_insert_is_idempotent() {
        let store = IndexStore::in_memory().unwrap();
        let atom = sample_atom("c:abc");
        let row = SpanRow::from_atom(&atom, 1, "h:head1", 42);
        store.insert_span(&row).unwrap();
        store.insert_span(&row).unwrap();
        assert_eq!(store.span_count("t:ex.com").unwrap(), 1);

        let loaded = store.get_span("t:ex.com", 1).unwrap().unwrap();
        assert_eq!(loaded.seq, 1);
        assert_eq!(loaded.head_hash, "h:head1");
        assert_eq!(loaded.atom, atom);
    }

    #[test]
    fn spans_before_pages_descending() {
        let store = IndexStore::in_memory().unwrap();
        for seq in 1..=5 {
            let atom = sample_atom(&format!("c:{seq}"));
            store
                .insert_span(&SpanRow::from_atom(&atom, seq, &format!("h:{seq}"), 10))
                .unwrap();
        }
        let page = store.spans_before("t:ex.com", 5, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].seq, 4);
        assert_eq!(page[1].seq, 3);
    }

    #[test]
    fn agreement_upsert_updates_metadata_only() {
        let store = IndexStore::in_memory().unwrap();
        let mut agreement = Agreement::new(
            "a:room:r:general",
            AgreementType::RoomGovernance,
            "t:ex.com",
            "u:alice",
            json!({"v": 1}),
        );
        store.upsert_agreement(&agreement).unwrap();
        agreement.metadata = json!({"v": 2});
        store.upsert_agreement(&agreement).unwrap();
        let loaded = store.get_agreement("a:room:r:general").unwrap().unwrap();
        assert_eq!(loaded.metadata, json!({"v": 2}));
        assert_eq!(loaded.kind, AgreementType::RoomGovernance);
    }

    #[test]
    fn missing_rows_are_none() {
        let store = IndexStore::in_memory().unwrap();
        assert!(store.get_span("t:ex.com", 9).unwrap().is_none());
        assert!(store.get_agreement("a:tenant:t:none").unwrap().is_none());
        assert!(!store.tenant_exists("t:none").unwrap());
    }
}
