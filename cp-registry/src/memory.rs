use cp_core::{ControlPlaneError, Result, WorkflowId, WorkflowInstance, WorkflowState};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Composable AND filter for `List`.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub states: HashSet<WorkflowState>,
    pub labels: HashMap<String, String>,
    pub template_id: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub(crate) fn matches(&self, wf: &WorkflowInstance) -> bool {
        if !self.states.is_empty() && !self.states.contains(&wf.state) {
            return false;
        }
        for (k, v) in &self.labels {
            if wf.labels.get(k) != Some(v) {
                return false;
            }
        }
        if let Some(template_id) = &self.template_id {
            if !template_id.is_empty() && &wf.template_id != template_id {
                return false;
            }
        }
        true
    }
}

/// Fast path: a map of live workflows with CRUD and filtered listing.
/// Every mutation takes a single exclusive lock for the duration of
/// the operation, including the body of `update`'s callback — callers must
/// not perform blocking IO inside it.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    inner: RwLock<HashMap<WorkflowId, WorkflowInstance>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, instance: WorkflowInstance) -> Result<()> {
        let mut guard = self.inner.write();
        if guard.contains_key(&instance.id) {
            return Err(ControlPlaneError::InvalidSpec {
                reason: format!("workflow {} already exists", instance.id),
            });
        }
        guard.insert(instance.id, instance);
        Ok(())
    }

    pub fn get(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        self.inner
            .read()
            .get(&id)
            .cloned()
            .ok_or(ControlPlaneError::WorkflowNotFound { id })
    }

    /// Applies `f` to the stored instance under the registry's single
    /// exclusive lock, held for `f`'s entire duration.
    pub fn update<F>(&self, id: WorkflowId, f: F) -> Result<WorkflowInstance>
    where
        F: FnOnce(&mut WorkflowInstance) -> Result<()>,
    {
        let mut guard = self.inner.write();
        let wf = guard.get_mut(&id).ok_or(ControlPlaneError::WorkflowNotFound { id })?;
        f(wf)?;
        Ok(wf.clone())
    }

    pub fn remove(&self, id: WorkflowId) -> Result<()> {
        self.inner
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(ControlPlaneError::WorkflowNotFound { id })
    }

    /// Stable: ties on `created_at` break by `id` lexicographically.
    pub fn list(&self, query: &ListQuery) -> Vec<WorkflowInstance> {
        let guard = self.inner.read();
        let mut matched: Vec<&WorkflowInstance> = guard.values().filter(|wf| query.matches(wf)).collect();
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.as_str().cmp(&b.id.as_str()))
        });

        let start = query.offset.min(matched.len());
        let end = match query.limit {
            Some(limit) => (start + limit).min(matched.len()),
            None => matched.len(),
        };
        matched[start..end].iter().map(|wf| (*wf).clone()).collect()
    }

    pub fn count(&self) -> HashMap<WorkflowState, usize> {
        let guard = self.inner.read();
        let mut counts = HashMap::new();
        for wf in guard.values() {
            *counts.entry(wf.state).or_insert(0) += 1;
        }
        counts
    }
}
