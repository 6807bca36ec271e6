//! Record store over `posts`, `users` and `comments`.
//!
//! Reads are public. Writes require a caller, and non-admin callers may only
//! touch rows they own (see [`Table::owner_column`]). The one anonymous write
//! is creating the profile row of an identity that has none yet, which is how
//! registration completes before the email is confirmed.
//!
//! Every successful write is published as a [`ChangeEvent`].

pub mod sql;

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use site_common::{ChangeEvent, ChangeKind, RecordQuery, Role, Table};

use crate::auth::AuthUser;
use crate::db::Database;
use crate::error::{ApiError, Result};

/// How an upsert resolves a row whose id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Apply the supplied columns to the existing row.
    Merge,
    /// Keep the existing row untouched and skip the supplied one.
    Ignore,
}

pub struct RecordService {
    db: Arc<Database>,
    changes: broadcast::Sender<ChangeEvent>,
}

fn caller_role(conn: &Connection, user_id: &str) -> Result<Role> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?1", [user_id], |row| row.get(0))
        .optional()?;
    Ok(role.as_deref().map(Role::parse_or_default).unwrap_or_default())
}

fn row_owner<'a>(table: Table, row: &'a Value) -> Option<&'a str> {
    row.get(table.owner_column()).and_then(Value::as_str)
}

fn row_id(row: &Value) -> Result<String> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::Internal("row without id".to_string()))
}

fn validate_columns(table: Table, row: &Map<String, Value>) -> Result<()> {
    row.keys().try_for_each(|column| sql::check_column(table, column))?;
    match row.get("id") {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(ApiError::Validation("'id' must be a string".to_string())),
    }
}

/// The anonymous profile-creation case: a `users` row for an existing
/// identity, carrying that identity's email.
fn is_unclaimed_profile(conn: &Connection, row: &Map<String, Value>) -> Result<bool> {
    let (Some(id), Some(email)) = (
        row.get("id").and_then(Value::as_str),
        row.get("email").and_then(Value::as_str),
    ) else {
        return Ok(false);
    };

    let identity_email: Option<String> = conn
        .query_row("SELECT email FROM identities WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;

    Ok(identity_email.is_some_and(|e| e.eq_ignore_ascii_case(email)))
}

/// A write attempted by a specific caller, with the admin bit resolved once.
struct Writer<'a> {
    user: &'a AuthUser,
    is_admin: bool,
}

impl Writer<'_> {
    fn load<'a>(conn: &Connection, user: &'a AuthUser) -> Result<Writer<'a>> {
        Ok(Writer {
            user,
            is_admin: caller_role(conn, &user.id)?.is_admin(),
        })
    }

    fn check_owns(&self, table: Table, row: &Value) -> Result<()> {
        if self.is_admin || row_owner(table, row) == Some(self.user.id.as_str()) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "Not allowed to modify this row of '{}'",
                table
            )))
        }
    }

    /// Set or check the owner column of a new row.
    fn claim(&self, table: Table, row: &mut Map<String, Value>) -> Result<()> {
        let column = table.owner_column();
        match row.get(column).and_then(Value::as_str) {
            None => {
                row.insert(column.to_string(), Value::String(self.user.id.clone()));
                Ok(())
            }
            Some(owner) if owner == self.user.id || self.is_admin => Ok(()),
            Some(_) => Err(ApiError::Forbidden(format!(
                "'{}' must be the caller's id",
                column
            ))),
        }
    }

    /// Checks for a patch applied to an existing row.
    fn check_patch(&self, table: Table, existing: &Value, patch: &Map<String, Value>) -> Result<()> {
        self.check_owns(table, existing)?;
        if self.is_admin {
            return Ok(());
        }

        let column = table.owner_column();
        if let Some(owner) = patch.get(column) {
            if owner.as_str() != row_owner(table, existing) {
                return Err(ApiError::Forbidden(format!("Cannot change '{}'", column)));
            }
        }

        if table == Table::Users {
            if let Some(role) = patch.get("role") {
                if Some(role) != existing.get("role") {
                    return Err(ApiError::Forbidden(
                        "Only admins can change roles".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl RecordService {
    pub fn new(db: Arc<Database>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self { db, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn publish(&self, table: Table, kind: ChangeKind, record: Value) {
        // No subscribers is not an error.
        let _ = self.changes.send(ChangeEvent::new(table, kind, record));
    }

    pub fn select(&self, table: Table, query: &RecordQuery) -> Result<Vec<Value>> {
        let conn = self.db.conn()?;
        sql::select(&conn, table, query)
    }

    /// Insert rows. With `conflict` set, rows whose id already exists are
    /// merged or skipped instead of failing.
    ///
    /// A batch is all or nothing: if any row is rejected no row is stored and
    /// nothing is published.
    pub fn insert(
        &self,
        table: Table,
        caller: Option<&AuthUser>,
        rows: Vec<Map<String, Value>>,
        conflict: Option<Conflict>,
    ) -> Result<Vec<Value>> {
        rows.iter().try_for_each(|row| validate_columns(table, row))?;

        let conn = self.db.conn()?;
        let tx = conn.unchecked_transaction()?;
        let writer = caller.map(|user| Writer::load(&tx, user)).transpose()?;

        let mut written = Vec::with_capacity(rows.len());
        let mut events = Vec::with_capacity(rows.len());

        for mut row in rows {
            let existing = match (conflict, row.get("id").and_then(Value::as_str)) {
                (Some(_), Some(id)) => sql::find_by_id(&tx, table, id)?,
                _ => None,
            };

            if let Some(existing) = existing {
                if conflict == Some(Conflict::Ignore) {
                    tracing::debug!("Skipping duplicate {} row {}", table, row_id(&existing)?);
                    continue;
                }
                let writer = writer.as_ref().ok_or_else(|| {
                    ApiError::Unauthorized("Authentication required".to_string())
                })?;
                writer.check_patch(table, &existing, &row)?;
                row.remove("id");
                row.remove("created_at");
                if table.has_column("updated_at") {
                    row.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
                }
                let updated = sql::update_by_id(&tx, table, &row_id(&existing)?, &row)?;
                events.push((ChangeKind::Update, updated.clone()));
                written.push(updated);
                continue;
            }

            match &writer {
                Some(writer) => writer.claim(table, &mut row)?,
                None => {
                    if table != Table::Users || !is_unclaimed_profile(&tx, &row)? {
                        return Err(ApiError::Unauthorized(
                            "Authentication required".to_string(),
                        ));
                    }
                    tracing::info!("Creating profile for identity without a session");
                }
            }

            sql::fill_defaults(table, &mut row);
            let inserted = sql::insert(&tx, table, &row)?;
            events.push((ChangeKind::Insert, inserted.clone()));
            written.push(inserted);
        }

        tx.commit()?;
        drop(conn);
        for (kind, record) in events {
            self.publish(table, kind, record);
        }
        Ok(written)
    }

    /// Apply `patch` to every row matching `query`. No version check; the last
    /// write wins.
    pub fn update(
        &self,
        table: Table,
        caller: &AuthUser,
        query: &RecordQuery,
        mut patch: Map<String, Value>,
    ) -> Result<Vec<Value>> {
        validate_columns(table, &patch)?;
        if patch.contains_key("id") {
            return Err(ApiError::Validation("Cannot change 'id'".to_string()));
        }
        if table.has_column("updated_at") && !patch.contains_key("updated_at") {
            patch.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        }

        let conn = self.db.conn()?;
        let writer = Writer::load(&conn, caller)?;
        let matched = sql::select(&conn, table, query)?;
        for row in &matched {
            writer.check_patch(table, row, &patch)?;
        }

        let mut updated = Vec::with_capacity(matched.len());
        for row in &matched {
            updated.push(sql::update_by_id(&conn, table, &row_id(row)?, &patch)?);
        }
        drop(conn);

        tracing::debug!("Updated {} row(s) in {}", updated.len(), table);
        for record in &updated {
            self.publish(table, ChangeKind::Update, record.clone());
        }
        Ok(updated)
    }

    /// Delete every row matching `query`. Returns the deleted rows.
    pub fn delete(&self, table: Table, caller: &AuthUser, query: &RecordQuery) -> Result<Vec<Value>> {
        let conn = self.db.conn()?;
        let writer = Writer::load(&conn, caller)?;
        let matched = sql::select(&conn, table, query)?;
        for row in &matched {
            writer.check_owns(table, row)?;
        }
        for row in &matched {
            sql::delete_by_id(&conn, table, &row_id(row)?)?;
        }
        drop(conn);

        tracing::debug!("Deleted {} row(s) from {}", matched.len(), table);
        for record in &matched {
            self.publish(table, ChangeKind::Delete, record.clone());
        }
        Ok(matched)
    }
}
