//! Temp container registry
//!
//! Helper containers spawned for commands that target a non-existent
//! container are tracked here and removed on engine disposal. Removal errors
//! are swallowed but surfaced as `temp:cleanup` events.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::command::SshOptions;

/// Label applied to every helper container, for external cleanup.
pub const MANAGED_LABEL: &str = "managed-by=xec";

/// Which daemon owns a temp container.
#[derive(Debug, Clone)]
pub enum TempOwner {
    /// The local docker daemon.
    Local,
    /// A remote daemon reached over SSH.
    Remote(SshOptions),
}

#[derive(Debug, Clone)]
pub struct TempContainer {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub owner: TempOwner,
    pub remove_on_dispose: bool,
}

/// Per-adapter set of owned helper containers.
///
/// Inserts and removals are serialised per entry by the map; reads are
/// lock-free.
#[derive(Default)]
pub struct TempContainerRegistry {
    entries: DashMap<String, TempContainer>,
}

impl TempContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, container: TempContainer) {
        self.entries.insert(container.name.clone(), container);
    }

    pub fn remove(&self, name: &str) -> Option<TempContainer> {
        self.entries.remove(name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every container marked for removal, leaving the rest.
    pub fn drain_removable(&self) -> Vec<TempContainer> {
        let names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().remove_on_dispose)
            .map(|e| e.key().clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| self.remove(&name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp(name: &str, removable: bool) -> TempContainer {
        TempContainer {
            name: name.to_string(),
            created_at: Utc::now(),
            owner: TempOwner::Local,
            remove_on_dispose: removable,
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = TempContainerRegistry::new();
        registry.insert(temp("xec-tmp-1", true));
        assert!(registry.contains("xec-tmp-1"));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove("xec-tmp-1").unwrap();
        assert_eq!(removed.name, "xec-tmp-1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_respects_remove_flag() {
        let registry = TempContainerRegistry::new();
        registry.insert(temp("keep-me", false));
        registry.insert(temp("drop-me", true));

        let drained = registry.drain_removable();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name, "drop-me");
        assert!(registry.contains("keep-me"));
    }
}
