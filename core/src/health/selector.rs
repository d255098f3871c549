use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::HealthConfig;

use super::store::{RankingStore, ResourceStore};

/// Picks the upstream identity to use for the next call.
///
/// Scores only ever go down: every selection costs one point and every
/// reported failure costs `failure_penalty`. Members chosen in the current
/// rotation round are passed over until every ranked member has had a turn.
///
/// Selection, penalties and expiry hold the round lock for their whole
/// read-modify-write, so a member popped by one caller is never visible as
/// missing to another.
pub struct HealthSelector {
    ranking: Arc<dyn RankingStore>,
    resources: Arc<dyn ResourceStore>,
    key: String,
    initial_score: f64,
    failure_penalty: f64,
    max_attempts: usize,
    round: Mutex<HashSet<String>>,
}

impl HealthSelector {
    pub fn new(
        ranking: Arc<dyn RankingStore>,
        resources: Arc<dyn ResourceStore>,
        key: impl Into<String>,
        cfg: &HealthConfig,
    ) -> Self {
        Self {
            ranking,
            resources,
            key: key.into(),
            initial_score: cfg.initial_score,
            failure_penalty: cfg.failure_penalty,
            max_attempts: cfg.max_select_attempts.max(1),
            round: Mutex::new(HashSet::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Pop the best usable resource, charge it one point and return its id.
    pub async fn select_best(&self) -> anyhow::Result<Option<String>> {
        let mut round = self.round.lock().await;
        let mut deferred: Vec<(String, f64)> = Vec::new();
        let selected = self.select_inner(&mut round, &mut deferred).await;

        // Members set aside for rotation go back with their scores untouched.
        for (member, score) in deferred {
            self.ranking.zadd(&self.key, score, &member).await?;
        }

        let selected = selected?;
        match &selected {
            Some(id) => tracing::debug!(target: "harvest.health", resource = %id, "resource selected"),
            None => tracing::warn!(target: "harvest.health", key = %self.key, "no usable resource"),
        }
        Ok(selected)
    }

    async fn select_inner(
        &self,
        round: &mut HashSet<String>,
        deferred: &mut Vec<(String, f64)>,
    ) -> anyhow::Result<Option<String>> {
        let mut attempts = 0usize;
        let mut seeded = false;

        loop {
            let (member, score) = match self.ranking.zpopmax(&self.key).await? {
                Some((member, score)) => {
                    if round.contains(&member) {
                        deferred.push((member, score));
                        continue;
                    }
                    (member, score)
                }
                None if !deferred.is_empty() => {
                    // Everyone ranked has had a turn: start a new round.
                    round.clear();
                    deferred.remove(0)
                }
                None if !seeded => {
                    seeded = true;
                    if self.seed_from_store().await? == 0 {
                        return Ok(None);
                    }
                    continue;
                }
                None => return Ok(None),
            };

            attempts += 1;

            if score <= 0.0 {
                tracing::warn!(target: "harvest.health", resource = %member, score, "score exhausted, expiring");
                self.resources.mark_expired(&member).await?;
            } else if !self.resources.is_usable(&member).await? {
                tracing::info!(target: "harvest.health", resource = %member, "resource no longer usable, dropped from ranking");
            } else {
                self.ranking.zadd(&self.key, score - 1.0, &member).await?;
                round.insert(member.clone());
                return Ok(Some(member));
            }

            if attempts >= self.max_attempts {
                return Ok(None);
            }
        }
    }

    /// Cold start: rank every eligible resource that is not ranked yet.
    async fn seed_from_store(&self) -> anyhow::Result<usize> {
        let mut seeded = 0;
        for id in self.resources.list_eligible().await? {
            if self.ranking.zscore(&self.key, &id).await?.is_none() {
                self.ranking.zadd(&self.key, self.initial_score, &id).await?;
                seeded += 1;
            }
        }
        if seeded > 0 {
            tracing::info!(target: "harvest.health", key = %self.key, seeded, "seeded ranking from resource store");
        }
        Ok(seeded)
    }

    /// Charge the failure penalty. Expires the resource once its score is exhausted.
    pub async fn report_failure(&self, id: &str) -> anyhow::Result<()> {
        let mut round = self.round.lock().await;
        if self.ranking.zscore(&self.key, id).await?.is_none() {
            // Already expired.
            return Ok(());
        }
        let score = self
            .ranking
            .zincrby(&self.key, -self.failure_penalty, id)
            .await?;
        tracing::debug!(target: "harvest.health", resource = %id, score, "failure penalty applied");
        if score <= 0.0 {
            self.expire(&mut round, id).await?;
        }
        Ok(())
    }

    /// Remove the resource from rotation until it is revalidated.
    pub async fn mark_expired(&self, id: &str) -> anyhow::Result<()> {
        let mut round = self.round.lock().await;
        self.expire(&mut round, id).await
    }

    async fn expire(&self, round: &mut HashSet<String>, id: &str) -> anyhow::Result<()> {
        self.resources.mark_expired(id).await?;
        self.ranking.zrem(&self.key, id).await?;
        round.remove(id);
        tracing::warn!(target: "harvest.health", resource = %id, "resource marked expired");
        Ok(())
    }

    /// Put an externally re-validated resource back at the initial score.
    pub async fn reinstate(&self, id: &str) -> anyhow::Result<bool> {
        let _round = self.round.lock().await;
        if !self.resources.revalidate(id).await? {
            return Ok(false);
        }
        self.ranking.zadd(&self.key, self.initial_score, id).await?;
        tracing::info!(target: "harvest.health", resource = %id, "resource reinstated");
        Ok(true)
    }
}
