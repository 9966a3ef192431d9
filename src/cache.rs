use std::collections::HashSet;

use crate::error::Result;
use crate::graph::Target;

/// Cache classification for a set of targets.
///
/// Remote hits are visible to every minion; local hits live only in the
/// client's cache and must be uploaded before remote machines can use
/// them.
#[derive(Debug, Clone, Default)]
pub struct CacheHitSet {
    remote: HashSet<Target>,
    local: HashSet<Target>,
}

impl CacheHitSet {
    pub fn new(
        remote: impl IntoIterator<Item = Target>,
        local: impl IntoIterator<Item = Target>,
    ) -> Self {
        Self {
            remote: remote.into_iter().collect(),
            local: local.into_iter().collect(),
        }
    }

    pub fn is_remote_hit(&self, target: &Target) -> bool {
        self.remote.contains(target)
    }

    pub fn is_local_hit(&self, target: &Target) -> bool {
        self.local.contains(target)
    }

    /// Hit in either cache.
    pub fn is_hit(&self, target: &Target) -> bool {
        self.is_remote_hit(target) || self.is_local_hit(target)
    }
}

/// Answers "which of these targets are already cached, and where".
///
/// The rule-key computation and artifact probing behind this live
/// outside the scheduler.
pub trait CacheStatusOracle: Send + Sync {
    fn classify(&self, targets: &[Target]) -> Result<CacheHitSet>;
}

/// Receives the pruned targets whose artifacts exist only in the local
/// cache and must be pushed to the remote cache before the fleet can
/// fetch them.
pub trait ArtifactUploader: Send + Sync {
    fn upload_critical_artifacts(&self, targets: &[Target]) -> Result<()>;
}

/// Uploader for runs without a remote artifact store attached. Logs
/// what would have been uploaded.
pub struct NoopUploader;

impl ArtifactUploader for NoopUploader {
    fn upload_critical_artifacts(&self, targets: &[Target]) -> Result<()> {
        tracing::debug!(count = targets.len(), "No artifact store configured, skipping upload");
        Ok(())
    }
}

/// Oracle over fixed hit sets, used by the CLI (hits listed in the
/// graph file) and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCacheOracle {
    remote: HashSet<Target>,
    local: HashSet<Target>,
}

impl StaticCacheOracle {
    pub fn new(
        remote: impl IntoIterator<Item = Target>,
        local: impl IntoIterator<Item = Target>,
    ) -> Self {
        Self {
            remote: remote.into_iter().collect(),
            local: local.into_iter().collect(),
        }
    }
}

impl CacheStatusOracle for StaticCacheOracle {
    fn classify(&self, targets: &[Target]) -> Result<CacheHitSet> {
        let remote = targets.iter().filter(|t| self.remote.contains(t)).cloned();
        let local = targets.iter().filter(|t| self.local.contains(t)).cloned();
        Ok(CacheHitSet::new(remote, local))
    }
}
