//! Remote project cache

use std::collections::HashMap;
use std::sync::RwLock;

/// A provider-side project/site resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProject {
    /// Provider-assigned identifier
    pub id: String,
    /// Deterministic name derived from the project id
    pub name: String,
    /// Default hostname when the provider reports one
    pub hostname: Option<String>,
}

#[derive(Debug, Clone)]
struct ProjectCacheEntry {
    project: RemoteProject,
    cached_at: u64,
}

/// Bounded map of project name to remote project. When full, the oldest
/// entry is evicted.
pub struct ProjectCache {
    entries: RwLock<HashMap<String, ProjectCacheEntry>>,
    capacity: usize,
    tick: std::sync::atomic::AtomicU64,
}

impl ProjectCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            tick: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn get(&self, name: &str) -> Option<RemoteProject> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(name).map(|e| e.project.clone())
    }

    pub fn insert(&self, project: RemoteProject) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        if !entries.contains_key(&project.name) && entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.cached_at)
                .map(|(name, _)| name.clone())
            {
                entries.remove(&oldest);
            }
        }

        // Insertion order rather than wall time, so same-second inserts still age
        let cached_at = self
            .tick
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        entries.insert(project.name.clone(), ProjectCacheEntry { project, cached_at });
    }

    /// Forget a project, e.g. after the provider reported it gone
    pub fn remove(&self, name: &str) -> Option<RemoteProject> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(name).map(|e| e.project)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
