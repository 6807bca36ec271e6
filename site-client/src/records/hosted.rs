//! HTTP + WebSocket client for the hosted record store.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use site_common::{ChangeEvent, RecordQuery, Table};

use super::{RecordStore, UpsertMode};
use crate::error::RecordError;
use crate::identity::error_from_response;

pub struct HostedRecordStore {
    http_client: Client,
    base_url: String,
    access_token: RwLock<Option<String>>,
}

impl HostedRecordStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RecordError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(None),
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn realtime_url(&self, table: Table) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/realtime/v1/{}", ws_base, table)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self.access_token.read().ok().and_then(|t| t.clone());
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn rows(&self, request: RequestBuilder) -> Result<Vec<Value>, RecordError> {
        let response = self.authorize(request).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn check(response: Response) -> Result<Response, RecordError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let (status, code, message) = error_from_response(response).await;
        tracing::debug!(status, ?code, "Record store error: {}", message);
        Err(RecordError::Store {
            status,
            code,
            message,
        })
    }
}

#[async_trait]
impl RecordStore for HostedRecordStore {
    async fn select(&self, table: Table, query: &RecordQuery) -> Result<Vec<Value>, RecordError> {
        let request = self
            .http_client
            .get(self.table_url(table))
            .query(&query.to_pairs());
        self.rows(request).await
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Vec<Value>, RecordError> {
        let request = self.http_client.post(self.table_url(table)).json(&row);
        self.rows(request).await
    }

    async fn update(
        &self,
        table: Table,
        filter: &RecordQuery,
        patch: Value,
    ) -> Result<Vec<Value>, RecordError> {
        let request = self
            .http_client
            .patch(self.table_url(table))
            .query(&filter.to_pairs())
            .json(&patch);
        self.rows(request).await
    }

    async fn delete(&self, table: Table, filter: &RecordQuery) -> Result<Vec<Value>, RecordError> {
        let request = self
            .http_client
            .delete(self.table_url(table))
            .query(&filter.to_pairs());
        self.rows(request).await
    }

    async fn upsert(
        &self,
        table: Table,
        row: Value,
        mode: UpsertMode,
    ) -> Result<Vec<Value>, RecordError> {
        let resolution = match mode {
            UpsertMode::Merge => "resolution=merge-duplicates",
            UpsertMode::IgnoreDuplicates => "resolution=ignore-duplicates",
        };
        let request = self
            .http_client
            .post(self.table_url(table))
            .query(&[("on_conflict", "id")])
            .header("Prefer", resolution)
            .json(&row);
        self.rows(request).await
    }

    async fn subscribe(&self, table: Table) -> Result<mpsc::Receiver<ChangeEvent>, RecordError> {
        let url = self.realtime_url(table);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (tx, rx) = mpsc::channel(64);

        tracing::debug!("Subscribed to {} changes at {}", table, url);

        tokio::spawn(async move {
            let (_write, mut read) = ws_stream.split();
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ChangeEvent>(&text) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring malformed change event: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Change feed for {} failed: {}", table, e);
                        break;
                    }
                }
            }
            tracing::debug!("Change feed for {} closed", table);
        });

        Ok(rx)
    }

    fn set_access_token(&self, token: Option<String>) {
        if let Ok(mut current) = self.access_token.write() {
            *current = token;
        }
    }
}
