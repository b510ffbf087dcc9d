use async_trait::async_trait;
use cp_adapters::ProcessEvent;
use cp_core::WorkflowId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::event::{classify, ControlPlaneEvent, EventFilter, EventType, WorkflowContextSnapshot};

const BROADCAST_CAPACITY: usize = 1024;

/// Supplies the point-in-time context the classifier stamps onto every
/// event. Implemented by `cp-control-plane` over the registry
/// so this crate never depends on `cp-registry` directly.
pub trait ContextProvider: Send + Sync + std::fmt::Debug {
    fn snapshot(&self) -> WorkflowContextSnapshot;
}

/// Bookkeeping side effect of classification ("increment...
/// decrement, never below zero").
pub trait ActiveWorkersSink: Send + Sync + std::fmt::Debug {
    fn increment(&self, id: WorkflowId);
    fn decrement(&self, id: WorkflowId);
}

/// Forwards terminal lifecycle events back through the facade so the
/// bookkeeping state transition happens exactly once.
#[async_trait]
pub trait LifecycleCallback: Send + Sync + std::fmt::Debug {
    async fn on_completed(&self, id: WorkflowId);
    async fn on_failed(&self, id: WorkflowId);
}

struct Attached {
    cancel: CancellationToken,
}

/// Cross-workflow event bus: per-workflow attach/detach, classification,
/// and filtered fan-out.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ControlPlaneEvent>,
    attached: DashMap<WorkflowId, Attached>,
    lifecycle: Arc<parking_lot::RwLock<Option<Arc<dyn LifecycleCallback>>>>,
}

impl std::fmt::Debug for Attached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attached").finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            attached: DashMap::new(),
            lifecycle: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    pub fn set_lifecycle_callback(&self, callback: Arc<dyn LifecycleCallback>) {
        *self.lifecycle.write() = Some(callback);
    }

    /// Idempotent: re-attaching an already-attached workflow is a no-op
    ///. Spawns the forwarder task that classifies every raw
    /// event from `events` and republishes it, preserving this workflow's
    /// emission order.
    pub fn attach_workflow(
        &self,
        id: WorkflowId,
        mut events: mpsc::Receiver<ProcessEvent>,
        context: Arc<dyn ContextProvider>,
        active_workers: Arc<dyn ActiveWorkersSink>,
    ) {
        if self.attached.contains_key(&id) {
            return;
        }
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let sender = self.sender.clone();
        let lifecycle = self.lifecycle.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    maybe_event = events.recv() => {
                        let Some(raw) = maybe_event else { break };
                        let snapshot = context.snapshot();
                        let event_type = classify(&raw.kind, raw.role);

                        match event_type {
                            EventType::WorkerSpawned => active_workers.increment(id),
                            EventType::WorkerRetired => active_workers.decrement(id),
                            _ => {}
                        }

                        let event = ControlPlaneEvent {
                            event_type,
                            at: raw.at,
                            workflow_id: snapshot.workflow_id,
                            template_id: snapshot.template_id,
                            workflow_name: snapshot.workflow_name,
                            state: snapshot.state,
                            process_id: raw.process_id,
                            task_id: raw.task_id,
                            payload: raw.payload,
                        };

                        let cb = lifecycle.read().clone();
                        if let Some(cb) = cb {
                            match event.event_type {
                                EventType::WorkflowCompleted => cb.on_completed(id).await,
                                EventType::WorkflowFailed => cb.on_failed(id).await,
                                _ => {}
                            }
                        }

                        if sender.send(event).is_err() {
                            // No subscribers currently listening; not an error.
                        }
                    }
                }
            }
        });

        self.attached.insert(id, Attached { cancel });
    }

    pub fn detach_workflow(&self, id: WorkflowId) {
        if let Some((_, attached)) = self.attached.remove(&id) {
            attached.cancel.cancel();
        }
    }

    pub fn is_attached(&self, id: WorkflowId) -> bool {
        self.attached.contains_key(&id)
    }

    /// Publishes a facade-originated lifecycle event directly (`workflow.created`,
    /// `workflow.paused`, `workflow.resumed`) without going through the classifier.
    pub fn publish(&self, event: ControlPlaneEvent) {
        let _ = self.sender.send(event);
    }

    /// Unfiltered subscription; closes when `cancel` fires.
    pub fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<ControlPlaneEvent> {
        self.subscribe_filtered(EventFilter::default(), cancel)
    }

    pub fn subscribe_workflow(&self, id: WorkflowId, cancel: CancellationToken) -> mpsc::Receiver<ControlPlaneEvent> {
        self.subscribe_filtered(EventFilter::workflow(id), cancel)
    }

    /// Spawns a forwarding task that applies `filter` to every broadcast
    /// event and pushes matches onto a bounded channel; stops on `cancel`
    /// or when the returned receiver is dropped.
    pub fn subscribe_filtered(&self, filter: EventFilter, cancel: CancellationToken) -> mpsc::Receiver<ControlPlaneEvent> {
        let mut broadcast_rx = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    received = broadcast_rx.recv() => {
                        match received {
                            Ok(event) => {
                                if filter.passes(&event) && tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "event subscriber lagged, dropping events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        rx
    }

    /// Detaches every workflow and closes the underlying broker. All
    /// outstanding subscriber channels close because
    /// the broadcast sender is dropped once `self` is dropped; detaching
    /// first ensures the forwarder tasks stop publishing immediately.
    pub fn close(&self) {
        let ids: Vec<WorkflowId> = self.attached.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.detach_workflow(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_adapters::{ProcessEventKind, ProcessRole};
    use cp_core::WorkflowState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct FixedContext(WorkflowContextSnapshot);

    impl ContextProvider for FixedContext {
        fn snapshot(&self) -> WorkflowContextSnapshot {
            self.0.clone()
        }
    }

    #[derive(Debug, Default)]
    struct CountingSink {
        count: AtomicU32,
    }

    impl ActiveWorkersSink for CountingSink {
        fn increment(&self, _id: WorkflowId) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        fn decrement(&self, _id: WorkflowId) {
            self.count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1))).ok();
        }
    }

    fn context(id: WorkflowId) -> Arc<dyn ContextProvider> {
        Arc::new(FixedContext(WorkflowContextSnapshot {
            workflow_id: id,
            template_id: "t".to_string(),
            workflow_name: None,
            state: WorkflowState::Running,
        }))
    }

    #[tokio::test]
    async fn attach_before_spawn_delivers_coordinator_spawned() {
        let bus = EventBus::new();
        let id = WorkflowId::new();

        let mut sub = bus.subscribe(CancellationToken::new());

        let (tx, rx) = mpsc::channel(8);
        bus.attach_workflow(id, rx, context(id), Arc::new(CountingSink::default()));

        tx.send(ProcessEvent::new(ProcessEventKind::ProcessSpawned, Some(ProcessRole::Coordinator)))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(received.event_type, EventType::CoordinatorSpawned);
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        let (_tx1, rx1) = mpsc::channel(8);
        bus.attach_workflow(id, rx1, context(id), Arc::new(CountingSink::default()));
        assert!(bus.is_attached(id));

        let (_tx2, rx2) = mpsc::channel(8);
        bus.attach_workflow(id, rx2, context(id), Arc::new(CountingSink::default()));
        assert!(bus.is_attached(id));
    }

    #[tokio::test]
    async fn preserves_per_workflow_event_order() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        let mut sub = bus.subscribe(CancellationToken::new());
        let (tx, rx) = mpsc::channel(8);
        bus.attach_workflow(id, rx, context(id), Arc::new(CountingSink::default()));

        for _ in 0..5 {
            tx.send(ProcessEvent::new(ProcessEventKind::ProcessReady, Some(ProcessRole::Worker)))
                .await
                .unwrap();
        }
        tx.send(ProcessEvent::new(ProcessEventKind::ProcessWorkflowComplete, None))
            .await
            .unwrap();

        for _ in 0..5 {
            let e = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
            assert_eq!(e.event_type, EventType::WorkerOutput);
        }
        let last = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(last.event_type, EventType::WorkflowCompleted);
    }

    #[tokio::test]
    async fn active_workers_increment_and_decrement() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        let sink = Arc::new(CountingSink::default());
        let (tx, rx) = mpsc::channel(8);
        bus.attach_workflow(id, rx, context(id), sink.clone());

        tx.send(ProcessEvent::new(ProcessEventKind::ProcessSpawned, Some(ProcessRole::Worker))).await.unwrap();
        tx.send(ProcessEvent::new(
            ProcessEventKind::ProcessStatusChange { status: cp_adapters::ProcessStatus::Retired },
            Some(ProcessRole::Worker),
        ))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscribe_filtered_excludes_other_workflows() {
        let bus = EventBus::new();
        let id_a = WorkflowId::new();
        let id_b = WorkflowId::new();
        let mut sub_a = bus.subscribe_workflow(id_a, CancellationToken::new());

        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        bus.attach_workflow(id_a, rx_a, context(id_a), Arc::new(CountingSink::default()));
        bus.attach_workflow(id_b, rx_b, context(id_b), Arc::new(CountingSink::default()));

        tx_b.send(ProcessEvent::new(ProcessEventKind::ProcessReady, Some(ProcessRole::Worker))).await.unwrap();
        tx_a.send(ProcessEvent::new(ProcessEventKind::ProcessWorkflowComplete, None)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), sub_a.recv()).await.unwrap().unwrap();
        assert_eq!(received.workflow_id, id_a);
    }

    #[tokio::test]
    async fn subscription_closes_on_cancellation() {
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe(cancel.clone());
        cancel.cancel();

        let received = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
        assert_eq!(received.unwrap(), None);
    }
}
