//! Record store client.
//!
//! [`RecordStore`] is the untyped CRUD surface over the hosted tables; the
//! repositories in [`repositories`] give it typed shapes. Updates carry no
//! version check, so overlapping writes resolve last-write-wins.

mod hosted;
pub mod repositories;

pub use hosted::HostedRecordStore;
pub use repositories::{CommentRepository, PostRepository, ProfileRepository};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use site_common::{ChangeEvent, RecordQuery, Table};

use crate::error::RecordError;

/// Resolution for a row whose id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Overwrite the supplied columns.
    Merge,
    /// Leave the existing row alone.
    IgnoreDuplicates,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn select(&self, table: Table, query: &RecordQuery) -> Result<Vec<Value>, RecordError>;

    async fn insert(&self, table: Table, row: Value) -> Result<Vec<Value>, RecordError>;

    async fn update(
        &self,
        table: Table,
        filter: &RecordQuery,
        patch: Value,
    ) -> Result<Vec<Value>, RecordError>;

    async fn delete(&self, table: Table, filter: &RecordQuery) -> Result<Vec<Value>, RecordError>;

    /// Insert keyed by `id`. Rows skipped under [`UpsertMode::IgnoreDuplicates`]
    /// are not returned.
    async fn upsert(
        &self,
        table: Table,
        row: Value,
        mode: UpsertMode,
    ) -> Result<Vec<Value>, RecordError>;

    /// Change notifications for `table`. The feed ends when the receiver is
    /// dropped or the connection closes.
    async fn subscribe(&self, table: Table) -> Result<mpsc::Receiver<ChangeEvent>, RecordError>;

    /// Bearer used for subsequent writes; `None` writes anonymously.
    fn set_access_token(&self, token: Option<String>);
}

pub(crate) fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, RecordError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(RecordError::from))
        .collect()
}

pub(crate) fn decode_first<T: DeserializeOwned>(
    rows: Vec<Value>,
    what: &str,
) -> Result<T, RecordError> {
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| RecordError::NotFound(what.to_string()))?;
    Ok(serde_json::from_value(row)?)
}
