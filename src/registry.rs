use std::sync::Arc;

use tracing::info;

use crate::db::{Database, OwnerScope, Source, SourceSpec};

/// Owns the set of sources each scope is subscribed to.
pub struct SubscriptionRegistry {
    db: Arc<Database>,
    seeds: Vec<SourceSpec>,
}

impl SubscriptionRegistry {
    pub fn new(db: Arc<Database>, seeds: Vec<SourceSpec>) -> Self {
        Self { db, seeds }
    }

    /// Subscribe, or update and reactivate an existing subscription to the same URL.
    pub async fn add(&self, scope: &OwnerScope, spec: &SourceSpec) -> anyhow::Result<Source> {
        let source = self.db.upsert_source(scope, spec).await?;
        info!(owner = %scope, source_id = source.id, url = %source.url, "Source subscribed");
        Ok(source)
    }

    /// Returns false if the source is not in this scope. Entries are kept.
    pub async fn set_active(
        &self,
        scope: &OwnerScope,
        source_id: i64,
        active: bool,
    ) -> anyhow::Result<bool> {
        self.db.set_source_active(scope, source_id, active).await
    }

    /// Returns false if the source is not in this scope.
    pub async fn remove(&self, scope: &OwnerScope, source_id: i64) -> anyhow::Result<bool> {
        let removed = self.db.delete_source(scope, source_id).await?;
        if removed {
            info!(owner = %scope, source_id, "Source removed");
        }
        Ok(removed)
    }

    /// Sources owned by `scope` itself; these are what a sync of `scope` fetches.
    pub async fn list(&self, scope: &OwnerScope, only_active: bool) -> anyhow::Result<Vec<Source>> {
        self.db.list_sources(scope, only_active).await
    }

    /// What `scope` can see: the shared sources first, then its own.
    pub async fn list_visible(
        &self,
        scope: &OwnerScope,
        only_active: bool,
    ) -> anyhow::Result<Vec<Source>> {
        self.db.list_visible_sources(scope, only_active).await
    }

    /// Insert missing seed sources into `scope`. Seeds already present keep
    /// their active flag.
    pub async fn seed(&self, scope: &OwnerScope) -> anyhow::Result<usize> {
        for spec in &self.seeds {
            self.db.seed_source(scope, spec).await?;
        }
        info!(owner = %scope, count = self.seeds.len(), "Seeded sources");
        Ok(self.seeds.len())
    }

    /// Seed only when the scope has never had a source, so user removals stick.
    pub async fn seed_if_empty(&self, scope: &OwnerScope) -> anyhow::Result<bool> {
        if self.seeds.is_empty() || self.db.count_sources(scope).await? > 0 {
            return Ok(false);
        }
        self.seed(scope).await?;
        Ok(true)
    }
}
