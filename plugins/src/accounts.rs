use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::api::{AccountConfig, ResourceStore};

struct AccountEntry {
    id: String,
    expires_at: Option<DateTime<Utc>>,
    expired: bool,
}

impl AccountEntry {
    fn usable(&self, now: DateTime<Utc>) -> bool {
        !self.expired && self.expires_at.map_or(true, |at| at > now)
    }
}

/// Upstream accounts from `[[accounts]]`. Expiry is tracked in memory only.
pub struct ConfigAccountStore {
    accounts: Mutex<Vec<AccountEntry>>,
}

impl ConfigAccountStore {
    pub fn new(accounts: &[AccountConfig]) -> Self {
        let accounts = accounts
            .iter()
            .map(|a| AccountEntry {
                id: a.id.clone(),
                expires_at: a.expires_at,
                expired: false,
            })
            .collect();
        Self {
            accounts: Mutex::new(accounts),
        }
    }

    fn accounts(&self) -> MutexGuard<'_, Vec<AccountEntry>> {
        self.accounts.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.accounts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts().is_empty()
    }
}

#[async_trait]
impl ResourceStore for ConfigAccountStore {
    async fn list_eligible(&self) -> anyhow::Result<Vec<String>> {
        let now = Utc::now();
        Ok(self
            .accounts()
            .iter()
            .filter(|a| a.usable(now))
            .map(|a| a.id.clone())
            .collect())
    }

    async fn is_usable(&self, id: &str) -> anyhow::Result<bool> {
        let now = Utc::now();
        Ok(self
            .accounts()
            .iter()
            .any(|a| a.id == id && a.usable(now)))
    }

    async fn mark_expired(&self, id: &str) -> anyhow::Result<()> {
        if let Some(entry) = self.accounts().iter_mut().find(|a| a.id == id) {
            entry.expired = true;
        }
        Ok(())
    }

    /// A configured expiry in the past cannot be revalidated in-process.
    async fn revalidate(&self, id: &str) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut accounts = self.accounts();
        let Some(entry) = accounts.iter_mut().find(|a| a.id == id) else {
            return Ok(false);
        };
        if entry.expires_at.is_some_and(|at| at <= now) {
            return Ok(false);
        }
        entry.expired = false;
        Ok(true)
    }
}
