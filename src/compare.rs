use chrono::Duration;
use std::sync::Arc;
use tracing::debug;

use crate::chain::VersionChain;
use crate::clock::{Clock, SystemClock};
use crate::diff::{diff, stats_of};
use crate::error::{VaultError, VaultResult};
use crate::model::comparison::{Comparison, ComparisonResult};
use crate::store::StateStore;

/// Directional diffs between two versions of a plugin, memoized for `ttl`.
///
/// `compare(a, b)` and `compare(b, a)` are cached independently. An expired
/// entry is recomputed and overwritten on the next request.
pub struct ComparisonCache {
    chain: Arc<VersionChain>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ComparisonCache {
    pub fn new(chain: Arc<VersionChain>, ttl: Duration) -> Self {
        Self {
            store: chain.store().clone(),
            chain,
            clock: Arc::new(SystemClock),
            ttl,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn compare(
        &self,
        plugin_id: &str,
        from_id: &str,
        to_id: &str,
    ) -> VaultResult<ComparisonResult> {
        // Both ends must belong to the plugin, cached or not.
        self.store.get_version(plugin_id, from_id).await?;
        self.store.get_version(plugin_id, to_id).await?;

        let now = self.clock.now();
        let fresh_since = now.checked_sub_signed(self.ttl).ok_or_else(|| {
            VaultError::ConfigError(format!(
                "comparison freshness window of {}s reaches before the earliest timestamp",
                self.ttl.num_seconds()
            ))
        })?;
        if let Some(comparison) = self
            .store
            .get_comparison_if_fresh(from_id, to_id, fresh_since)
            .await?
        {
            debug!(plugin_id, from_id, to_id, "comparison cache hit");
            return Ok(ComparisonResult {
                comparison,
                cached: true,
            });
        }

        let from_state = self.chain.reconstruct(plugin_id, from_id).await?;
        let to_state = self.chain.reconstruct(plugin_id, to_id).await?;
        let patch = diff(&from_state, &to_state);
        let stats = stats_of(&patch);
        let comparison = Comparison::from_patch(from_id, to_id, patch, stats, now);

        self.store.upsert_comparison(comparison.clone()).await?;
        debug!(
            plugin_id,
            from_id,
            to_id,
            files_changed = comparison.stats.files_changed,
            "comparison computed"
        );

        Ok(ComparisonResult {
            comparison,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainSettings, CommitRequest};
    use crate::clock::ManualClock;
    use crate::live::InMemoryLiveRegistry;
    use crate::model::state::PluginState;
    use crate::store::InMemoryStateStore;

    struct Fixture {
        cache: ComparisonCache,
        clock: Arc<ManualClock>,
        chain: Arc<VersionChain>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let live = Arc::new(InMemoryLiveRegistry::new());
        let clock = Arc::new(ManualClock::default());
        let chain = Arc::new(
            VersionChain::new(store, live.clone(), live, ChainSettings::default())
                .with_clock(clock.clone()),
        );
        let cache =
            ComparisonCache::new(chain.clone(), Duration::hours(1)).with_clock(clock.clone());
        Fixture {
            cache,
            clock,
            chain,
        }
    }

    async fn two_commits(chain: &VersionChain) -> (String, String) {
        let a = chain
            .commit(CommitRequest::new(
                "orders",
                PluginState::new()
                    .with_source("controller", "one\ntwo\n")
                    .with_source("helper", "x\n"),
            ))
            .await
            .unwrap();
        let b = chain
            .commit(CommitRequest::new(
                "orders",
                PluginState::new()
                    .with_source("controller", "one\nthree\n")
                    .with_source("job", "run\n"),
            ))
            .await
            .unwrap();
        (a.version.id, b.version.id)
    }

    #[tokio::test]
    async fn test_second_compare_is_cached() {
        let f = fixture();
        let (a, b) = two_commits(&f.chain).await;

        let first = f.cache.compare("orders", &a, &b).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.comparison.added, vec!["job".to_string()]);
        assert_eq!(first.comparison.modified, vec!["controller".to_string()]);
        assert_eq!(first.comparison.deleted, vec!["helper".to_string()]);
        assert_eq!(first.comparison.stats.files_changed, 3);

        let second = f.cache.compare("orders", &a, &b).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.comparison, first.comparison);
    }

    #[tokio::test]
    async fn test_expired_entry_is_recomputed() {
        let f = fixture();
        let (a, b) = two_commits(&f.chain).await;

        f.cache.compare("orders", &a, &b).await.unwrap();
        f.clock.advance(Duration::minutes(59));
        assert!(f.cache.compare("orders", &a, &b).await.unwrap().cached);

        f.clock.advance(Duration::minutes(2));
        let refreshed = f.cache.compare("orders", &a, &b).await.unwrap();
        assert!(!refreshed.cached);
        assert_eq!(refreshed.comparison.computed_at, f.clock.now());
    }

    #[tokio::test]
    async fn test_directions_are_cached_separately() {
        let f = fixture();
        let (a, b) = two_commits(&f.chain).await;

        let forward = f.cache.compare("orders", &a, &b).await.unwrap();
        let backward = f.cache.compare("orders", &b, &a).await.unwrap();
        assert!(!backward.cached);
        assert_eq!(backward.comparison.added, forward.comparison.deleted);
        assert_eq!(backward.comparison.deleted, forward.comparison.added);
        assert_eq!(
            backward.comparison.stats.lines_added,
            forward.comparison.stats.lines_deleted
        );
    }

    #[tokio::test]
    async fn test_window_before_earliest_time_is_config_error() {
        let f = fixture();
        let (a, b) = two_commits(&f.chain).await;
        let cache = ComparisonCache::new(f.chain.clone(), Duration::milliseconds(i64::MAX))
            .with_clock(f.clock.clone());

        let err = cache.compare("orders", &a, &b).await.unwrap_err();
        assert!(matches!(err, VaultError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_foreign_version_is_not_found() {
        let f = fixture();
        let (a, b) = two_commits(&f.chain).await;
        assert!(f
            .cache
            .compare("billing", &a, &b)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
