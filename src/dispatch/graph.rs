//! Dependency bookkeeping for dispatched chunks.

use std::collections::{HashMap, HashSet};

use crate::splitter::DispatchEntry;

/// Lifecycle of one chunk inside a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never run: a dependency failed, or the chunk can never become ready.
    Skipped { reason: String },
}

impl ChunkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped { .. })
    }
}

/// Tracks which chunks may start.
///
/// A dependency id resolves to the chunk with that id, or to every chunk
/// split from the subtask with that id. Ids that match nothing in the
/// manifest refer to work outside this dispatch and count as satisfied.
#[derive(Debug)]
pub struct ChunkGraph {
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
    states: HashMap<String, ChunkState>,
}

impl ChunkGraph {
    pub fn new(entries: &[DispatchEntry]) -> Self {
        let ids: HashSet<&str> = entries.iter().map(|e| e.subtask_id.as_str()).collect();
        let mut by_source: HashMap<&str, Vec<String>> = HashMap::new();
        for entry in entries {
            if let Some(source) = entry.source_subtask_id.as_deref() {
                by_source
                    .entry(source)
                    .or_default()
                    .push(entry.subtask_id.clone());
            }
        }

        let mut deps = HashMap::new();
        let mut states = HashMap::new();
        let mut order = Vec::new();
        for entry in entries {
            let id = entry.subtask_id.clone();
            let mut resolved: Vec<String> = Vec::new();
            for dep in &entry.depends_on {
                let targets = if ids.contains(dep.as_str()) {
                    vec![dep.clone()]
                } else {
                    by_source.get(dep.as_str()).cloned().unwrap_or_default()
                };
                for target in targets {
                    if target != id && !resolved.contains(&target) {
                        resolved.push(target);
                    }
                }
            }
            deps.insert(id.clone(), resolved);
            states.insert(id.clone(), ChunkState::Pending);
            order.push(id);
        }
        Self {
            order,
            deps,
            states,
        }
    }

    pub fn state(&self, id: &str) -> Option<&ChunkState> {
        self.states.get(id)
    }

    /// Why `id` was skipped, if it was.
    pub fn skip_reason(&self, id: &str) -> Option<&str> {
        match self.state(id) {
            Some(ChunkState::Skipped { reason }) => Some(reason),
            _ => None,
        }
    }

    /// Internal dependencies of `id` after resolution.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.deps.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pending chunks whose dependencies have all succeeded, in manifest order.
    pub fn ready(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.states.get(*id) == Some(&ChunkState::Pending))
            .filter(|id| {
                self.dependencies(id)
                    .iter()
                    .all(|dep| self.states.get(dep) == Some(&ChunkState::Succeeded))
            })
            .cloned()
            .collect()
    }

    pub fn mark_running(&mut self, id: &str) {
        self.states.insert(id.to_string(), ChunkState::Running);
    }

    pub fn mark_succeeded(&mut self, id: &str) {
        self.states.insert(id.to_string(), ChunkState::Succeeded);
    }

    /// Mark `id` failed and skip everything that transitively depends on it.
    ///
    /// Returns the newly skipped chunk ids.
    pub fn mark_failed(&mut self, id: &str) -> Vec<String> {
        self.states.insert(id.to_string(), ChunkState::Failed);
        self.skip_dependents(id)
    }

    fn skip_dependents(&mut self, failed: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut frontier = vec![failed.to_string()];
        while let Some(current) = frontier.pop() {
            let dependents: Vec<String> = self
                .order
                .iter()
                .filter(|id| self.states.get(*id) == Some(&ChunkState::Pending))
                .filter(|id| self.dependencies(id).contains(&current))
                .cloned()
                .collect();
            for id in dependents {
                self.states.insert(
                    id.clone(),
                    ChunkState::Skipped {
                        reason: format!("dependency '{}' failed", current),
                    },
                );
                frontier.push(id.clone());
                skipped.push(id);
            }
        }
        skipped
    }

    /// Skip every chunk still pending. Used once nothing is running and
    /// nothing is ready, which only happens for dependency cycles.
    pub fn skip_unreachable(&mut self) -> Vec<String> {
        let stuck: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.states.get(*id) == Some(&ChunkState::Pending))
            .cloned()
            .collect();
        for id in &stuck {
            self.states.insert(
                id.clone(),
                ChunkState::Skipped {
                    reason: "dependencies can never be satisfied".to_string(),
                },
            );
        }
        stuck
    }

    pub fn all_terminal(&self) -> bool {
        self.states.values().all(ChunkState::is_terminal)
    }
}
