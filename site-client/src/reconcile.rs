//! Profile reconciliation.
//!
//! Registration writes the identity first and the profile second. When the
//! second write fails the profile is journaled here and retried until the
//! record store accepts it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use site_common::NewProfile;

use crate::error::StorageError;
use crate::records::ProfileRepository;
use crate::storage::{get_json, set_json, LocalStorage};

pub const JOURNAL_KEY: &str = "profiles.pending";

/// Profiles waiting to be written, keyed by identity id.
#[derive(Clone)]
pub struct ProfileJournal {
    storage: Arc<dyn LocalStorage>,
}

impl ProfileJournal {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    fn load(&self) -> Result<BTreeMap<String, NewProfile>, StorageError> {
        Ok(get_json(self.storage.as_ref(), JOURNAL_KEY)?.unwrap_or_default())
    }

    fn save(&self, entries: &BTreeMap<String, NewProfile>) -> Result<(), StorageError> {
        if entries.is_empty() {
            self.storage.remove(JOURNAL_KEY)
        } else {
            set_json(self.storage.as_ref(), JOURNAL_KEY, entries)
        }
    }

    pub fn record(&self, profile: &NewProfile) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        entries.insert(profile.id.clone(), profile.clone());
        self.save(&entries)
    }

    pub fn remove(&self, id: &str) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        if entries.remove(id).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<NewProfile>, StorageError> {
        Ok(self.load()?.remove(id))
    }

    pub fn pending(&self) -> Result<Vec<NewProfile>, StorageError> {
        Ok(self.load()?.into_values().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    /// Rows that already existed; their journal entries are dropped.
    pub already_present: usize,
    pub failed: usize,
}

pub struct ProfileReconciler {
    profiles: ProfileRepository,
    journal: ProfileJournal,
}

impl ProfileReconciler {
    pub fn new(profiles: ProfileRepository, journal: ProfileJournal) -> Self {
        Self { profiles, journal }
    }

    /// Retry every pending profile once.
    pub async fn run_once(&self) -> Result<ReconcileReport, StorageError> {
        let mut report = ReconcileReport::default();
        for profile in self.journal.pending()? {
            match self.profiles.create_if_missing(&profile).await {
                Ok(created) => {
                    if created {
                        report.created += 1;
                    } else {
                        report.already_present += 1;
                    }
                    self.journal.remove(&profile.id)?;
                }
                Err(e) => {
                    tracing::debug!("Profile {} still pending: {}", profile.id, e);
                    report.failed += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            tracing::info!(
                created = report.created,
                already_present = report.already_present,
                failed = report.failed,
                "Profile reconciliation pass finished"
            );
        }
        Ok(report)
    }

    /// Run [`Self::run_once`] every `every`, starting immediately.
    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::warn!("Profile reconciliation failed: {}", e);
                }
            }
        })
    }
}
