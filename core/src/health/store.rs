use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

/// Shared score-ranked set, modelled on a sorted-set server.
///
/// `zpopmax` must be atomic: concurrent callers never receive the same member.
#[async_trait]
pub trait RankingStore: Send + Sync {
    async fn zpopmax(&self, key: &str) -> anyhow::Result<Option<(String, f64)>>;
    async fn zadd(&self, key: &str, score: f64, member: &str) -> anyhow::Result<()>;
    /// Adds `delta` to the member's score (creating it at `delta` if absent) and returns the new score.
    async fn zincrby(&self, key: &str, delta: f64, member: &str) -> anyhow::Result<f64>;
    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<bool>;
    async fn zscore(&self, key: &str, member: &str) -> anyhow::Result<Option<f64>>;
    async fn zcard(&self, key: &str) -> anyhow::Result<usize>;
}

/// Backing store of upstream identities (accounts, credentials).
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list_eligible(&self) -> anyhow::Result<Vec<String>>;
    /// Still usable right now (not revoked, not past its expiry).
    async fn is_usable(&self, id: &str) -> anyhow::Result<bool>;
    async fn mark_expired(&self, id: &str) -> anyhow::Result<()>;
    /// External re-validation. Returns true when the resource is eligible again.
    async fn revalidate(&self, id: &str) -> anyhow::Result<bool>;
}

/// In-process ranking store. Every operation holds one mutex, which makes
/// pop-max-and-remove atomic.
#[derive(Default)]
pub struct MemoryRankingStore {
    sets: Mutex<HashMap<String, HashMap<String, f64>>>,
}

impl MemoryRankingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, f64>>> {
        self.sets.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Members ordered by descending score.
    pub fn ranked(&self, key: &str) -> Vec<(String, f64)> {
        let sets = self.sets();
        let mut out: Vec<(String, f64)> = sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        out
    }
}

#[async_trait]
impl RankingStore for MemoryRankingStore {
    async fn zpopmax(&self, key: &str) -> anyhow::Result<Option<(String, f64)>> {
        let mut sets = self.sets();
        let Some(set) = sets.get_mut(key) else {
            return Ok(None);
        };
        // Ties resolve to the lexicographically greatest member.
        let best = set
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(m, s)| (m.clone(), *s));
        if let Some((member, _)) = &best {
            set.remove(member);
        }
        Ok(best)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> anyhow::Result<()> {
        self.sets()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zincrby(&self, key: &str, delta: f64, member: &str) -> anyhow::Result<f64> {
        let mut sets = self.sets();
        let score = sets
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        Ok(self
            .sets()
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zscore(&self, key: &str, member: &str) -> anyhow::Result<Option<f64>> {
        Ok(self.sets().get(key).and_then(|set| set.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> anyhow::Result<usize> {
        Ok(self.sets().get(key).map(|set| set.len()).unwrap_or(0))
    }
}
