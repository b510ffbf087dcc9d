use cp_adapters::ProcessProbe;
use cp_core::{ControlPlaneError, Result, RuntimeHandles, WorkflowId, WorkflowInstance, WorkflowState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::memory::ListQuery;
use crate::record::{SessionRecord, SessionState};
use crate::repository::{ListFilter, RepositoryError, SessionRepository};

/// Layered registry: persistent rows ⊕ runtime handles, with ownership
/// claims applied on every `list`.
pub struct DurableRegistry {
    project: String,
    pid: u32,
    repo: Arc<dyn SessionRepository>,
    probe: Arc<dyn ProcessProbe>,
    runtimes: RwLock<HashMap<WorkflowId, WorkflowInstance>>,
}

impl std::fmt::Debug for DurableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableRegistry")
            .field("project", &self.project)
            .field("pid", &self.pid)
            .finish()
    }
}

impl DurableRegistry {
    pub fn new(
        project: impl Into<String>,
        repo: Arc<dyn SessionRepository>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            project: project.into(),
            pid: std::process::id(),
            repo,
            probe,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts a brand-new session record owned by this process, and
    /// registers it as a live runtime.
    pub async fn put(&self, instance: WorkflowInstance) -> Result<()> {
        let mut record = SessionRecord::from_instance(&self.project, &instance, self.pid);
        self.repo
            .save(&mut record)
            .await
            .map_err(|e| ControlPlaneError::persistence("put", e))?;
        self.runtimes.write().insert(instance.id, instance);
        Ok(())
    }

    pub async fn get(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        if let Some(wf) = self.runtimes.read().get(&id).cloned() {
            return Ok(wf);
        }
        let record = self
            .repo
            .find_by_guid(&self.project, &id.to_string())
            .await
            .map_err(|e| to_domain_error(id, e))?;
        record
            .to_cold_instance()
            .ok_or(ControlPlaneError::WorkflowNotFound { id })
    }

    /// Best-effort: persists the current in-memory state of a live runtime
    /// instance. Failures are logged, never surfaced — in-memory state
    /// remains authoritative.
    pub async fn persist(&self, id: WorkflowId) -> Result<()> {
        let Some(wf) = self.runtimes.read().get(&id).cloned() else {
            return Ok(());
        };
        let existing = self.repo.find_by_guid(&self.project, &id.to_string()).await;
        match existing {
            Ok(mut record) => {
                record.apply_instance(&wf);
                if let Err(e) = self.repo.save(&mut record).await {
                    warn!(%id, error = %e, "best-effort persist failed");
                }
            }
            Err(e) => warn!(%id, error = %e, "best-effort persist: record missing"),
        }
        Ok(())
    }

    pub async fn archive(&self, id: WorkflowId) -> Result<()> {
        let mut record = self
            .repo
            .find_by_guid(&self.project, &id.to_string())
            .await
            .map_err(|e| to_domain_error(id, e))?;
        record.archive();
        self.repo
            .save(&mut record)
            .await
            .map_err(|e| ControlPlaneError::persistence("archive", e))?;
        self.runtimes.write().remove(&id);
        Ok(())
    }

    pub async fn remove(&self, id: WorkflowId) -> Result<()> {
        self.runtimes.write().remove(&id);
        match self.repo.delete(&self.project, &id.to_string()).await {
            Ok(()) | Err(RepositoryError::NotFound) => Ok(()),
            Err(e) => Err(ControlPlaneError::persistence("remove", e)),
        }
    }

    /// Synchronous, runtime-map-only read: `None` for a cold workflow this
    /// process hasn't loaded. Used by callers that cannot await — the event
    /// bus's context provider and the health monitor's recovery bridge
    ///, mirroring `InMemoryRegistry::get`.
    pub fn peek(&self, id: WorkflowId) -> Option<WorkflowInstance> {
        self.runtimes.read().get(&id).cloned()
    }

    /// Applies `f` to the in-memory instance under the runtime map's
    /// exclusive lock, held for `f`'s entire duration, mirroring
    /// `InMemoryRegistry::update`. Does not touch persisted state; callers
    /// follow up with `persist` when the mutation should survive a restart.
    pub fn update<F>(&self, id: WorkflowId, f: F) -> Result<WorkflowInstance>
    where
        F: FnOnce(&mut WorkflowInstance) -> Result<()>,
    {
        let mut guard = self.runtimes.write();
        let wf = guard.get_mut(&id).ok_or(ControlPlaneError::WorkflowNotFound { id })?;
        f(wf)?;
        Ok(wf.clone())
    }

    /// Manages the runtime-map side only, for resume/pause without
    /// altering persisted state.
    pub fn attach_runtime(&self, id: WorkflowId, runtime: RuntimeHandles) {
        if let Some(wf) = self.runtimes.write().get_mut(&id) {
            wf.runtime = Some(runtime);
        }
    }

    pub fn detach_runtime(&self, id: WorkflowId) {
        if let Some(wf) = self.runtimes.write().get_mut(&id) {
            wf.runtime = None;
        }
    }

    /// Applies the ownership-claim protocol to every persisted row, then
    /// the in-memory-only filters `query` carries.
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<WorkflowInstance>> {
        let filter = ListFilter {
            state: None,
            owner_current_pid: None,
            include_deleted: false,
            include_archived: false,
            limit: None,
        };
        let rows = self
            .repo
            .list_with_filter(&self.project, &filter)
            .await
            .map_err(|e| ControlPlaneError::persistence("list", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut handle = {
                let runtimes = self.runtimes.read();
                match runtimes.get(&row.guid.parse().unwrap_or_default()) {
                    Some(wf) => wf.clone(),
                    None => match row.to_cold_instance() {
                        Some(wf) => wf,
                        None => continue,
                    },
                }
            };

            if let Some(owner_pid) = row.owner_current_pid {
                if owner_pid != self.pid {
                    if self.probe.is_alive(owner_pid) {
                        handle.is_locked = true;
                    } else {
                        let mut claimed = row.clone();
                        claimed.owner_current_pid = Some(self.pid);
                        if self.repo.save(&mut claimed).await.is_ok() {
                            handle.is_locked = false;
                        } else {
                            handle.is_locked = false;
                        }
                    }
                } else {
                    handle.is_locked = false;
                }
            }

            out.push(handle);
        }

        out.retain(|wf| query.matches(wf));
        let start = query.offset.min(out.len());
        let end = match query.limit {
            Some(limit) => (start + limit).min(out.len()),
            None => out.len(),
        };
        Ok(out[start..end].to_vec())
    }

    pub async fn count(&self) -> Result<HashMap<WorkflowState, usize>> {
        let filter = ListFilter::default();
        let rows = self
            .repo
            .list_with_filter(&self.project, &filter)
            .await
            .map_err(|e| ControlPlaneError::persistence("count", e))?;
        let mut counts = HashMap::new();
        for row in rows {
            *counts.entry(session_state_to_workflow(row.state)).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

fn session_state_to_workflow(state: SessionState) -> WorkflowState {
    state.to_workflow_state()
}

fn to_domain_error(id: WorkflowId, e: RepositoryError) -> ControlPlaneError {
    match e {
        RepositoryError::NotFound => ControlPlaneError::WorkflowNotFound { id },
        other => ControlPlaneError::persistence("lookup", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteSessionRepository;
    use cp_core::WorkflowSpec;

    #[derive(Debug)]
    struct FixedProbe {
        alive_pid: u32,
    }

    impl ProcessProbe for FixedProbe {
        fn is_alive(&self, pid: u32) -> bool {
            pid == self.alive_pid
        }
    }

    async fn registry_with_probe(alive_pid: u32) -> DurableRegistry {
        let repo = Arc::new(SqliteSessionRepository::open_in_memory().await.unwrap());
        DurableRegistry::new("proj-a", repo, Arc::new(FixedProbe { alive_pid }))
    }

    #[tokio::test]
    async fn dead_owner_is_claimed_on_list() {
        let reg = registry_with_probe(0).await;
        let wf = WorkflowInstance::new(&WorkflowSpec::new("t", "p").unwrap());
        let id = wf.id;

        let mut record = SessionRecord::from_instance("proj-a", &wf, 999_999_999);
        reg.repo.save(&mut record).await.unwrap();

        let results = reg.list(&ListQuery::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_locked);

        let reloaded = reg.repo.find_by_guid("proj-a", &id.to_string()).await.unwrap();
        assert_eq!(reloaded.owner_current_pid, Some(reg.pid));
    }

    #[tokio::test]
    async fn live_foreign_owner_is_locked_and_untouched() {
        let live_pid = 555;
        let reg = registry_with_probe(live_pid).await;
        let wf = WorkflowInstance::new(&WorkflowSpec::new("t", "p").unwrap());
        let id = wf.id;

        let mut record = SessionRecord::from_instance("proj-a", &wf, live_pid);
        reg.repo.save(&mut record).await.unwrap();

        let results = reg.list(&ListQuery::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_locked);

        let reloaded = reg.repo.find_by_guid("proj-a", &id.to_string()).await.unwrap();
        assert_eq!(reloaded.owner_current_pid, Some(live_pid));
    }

    #[tokio::test]
    async fn self_owned_row_is_never_locked() {
        let reg = registry_with_probe(0).await;
        let wf = WorkflowInstance::new(&WorkflowSpec::new("t", "p").unwrap());
        let mut record = SessionRecord::from_instance("proj-a", &wf, reg.pid);
        reg.repo.save(&mut record).await.unwrap();

        let results = reg.list(&ListQuery::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_locked);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let reg = registry_with_probe(0).await;
        let wf = WorkflowInstance::new(&WorkflowSpec::new("t", "p").unwrap());
        let id = wf.id;
        reg.put(wf).await.unwrap();

        let fetched = reg.get(id).await.unwrap();
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn peek_sees_only_live_runtimes() {
        let reg = registry_with_probe(0).await;
        let wf = WorkflowInstance::new(&WorkflowSpec::new("t", "p").unwrap());
        let id = wf.id;
        assert!(reg.peek(id).is_none());
        reg.put(wf).await.unwrap();
        assert!(reg.peek(id).is_some());
    }

    #[tokio::test]
    async fn update_mutates_runtime_map_only() {
        use cp_core::WorkflowState;
        let reg = registry_with_probe(0).await;
        let wf = WorkflowInstance::new(&WorkflowSpec::new("t", "p").unwrap());
        let id = wf.id;
        reg.put(wf).await.unwrap();

        let updated = reg.update(id, |w| w.transition_to(WorkflowState::Running)).unwrap();
        assert_eq!(updated.state, WorkflowState::Running);
        assert_eq!(reg.peek(id).unwrap().state, WorkflowState::Running);
    }

    #[tokio::test]
    async fn update_missing_workflow_is_not_found() {
        let reg = registry_with_probe(0).await;
        let err = reg.update(WorkflowId::new(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, ControlPlaneError::WorkflowNotFound { .. }));
    }
}
