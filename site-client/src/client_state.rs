//! Client-only convenience state kept in local storage.
//!
//! None of this is authoritative.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;
use crate::storage::{get_json, set_json, LocalStorage};

pub const VIEW_HISTORY_KEY: &str = "client.view_history";
pub const NEWSLETTER_KEY: &str = "client.newsletter_emails";
pub const SAVED_ARTICLES_KEY: &str = "client.saved_articles";

pub const VIEW_HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
pub struct ClientState {
    storage: Arc<dyn LocalStorage>,
}

impl ClientState {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    fn list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StorageError> {
        Ok(get_json(self.storage.as_ref(), key)?.unwrap_or_default())
    }

    fn store<T: Serialize>(&self, key: &str, items: &[T]) -> Result<(), StorageError> {
        set_json(self.storage.as_ref(), key, &items)
    }

    /// Record a visit to `path`, most recent first.
    pub fn record_view(&self, path: &str) -> Result<(), StorageError> {
        let mut history: Vec<String> = self.list(VIEW_HISTORY_KEY)?;
        history.retain(|p| p != path);
        history.insert(0, path.to_string());
        history.truncate(VIEW_HISTORY_LIMIT);
        self.store(VIEW_HISTORY_KEY, &history)
    }

    pub fn view_history(&self) -> Result<Vec<String>, StorageError> {
        self.list(VIEW_HISTORY_KEY)
    }

    /// Add an email to the newsletter list. Returns `false` if it was already
    /// present, compared case-insensitively.
    pub fn subscribe_newsletter(&self, email: &str) -> Result<bool, StorageError> {
        let email = email.trim();
        let mut emails: Vec<String> = self.list(NEWSLETTER_KEY)?;
        if emails.iter().any(|e| e.eq_ignore_ascii_case(email)) {
            return Ok(false);
        }
        emails.push(email.to_string());
        self.store(NEWSLETTER_KEY, &emails)?;
        Ok(true)
    }

    pub fn newsletter_emails(&self) -> Result<Vec<String>, StorageError> {
        self.list(NEWSLETTER_KEY)
    }

    /// Save or unsave an article. Returns whether it is saved afterwards.
    pub fn toggle_saved_article(&self, id: &str) -> Result<bool, StorageError> {
        let mut saved: Vec<String> = self.list(SAVED_ARTICLES_KEY)?;
        let now_saved = match saved.iter().position(|s| s == id) {
            Some(index) => {
                saved.remove(index);
                false
            }
            None => {
                saved.push(id.to_string());
                true
            }
        };
        self.store(SAVED_ARTICLES_KEY, &saved)?;
        Ok(now_saved)
    }

    pub fn saved_articles(&self) -> Result<Vec<String>, StorageError> {
        self.list(SAVED_ARTICLES_KEY)
    }
}
