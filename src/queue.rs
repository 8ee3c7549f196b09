//! Dependency Queue: a FIFO of pending tasks gated by the partial order
//! `dependsOn` over dependency classes (§4.2).
//!
//! Scheduling policy and the concurrency-cap/priority mechanics are
//! generalized from Cargo's `JobQueue`/`DependencyQueue` (sync, thread/mpsc
//! based) to an async, tokio-based equivalent: instead of a worker pool
//! pulling jobs off a channel, callers `enqueue` a task and `.await`
//! `wait_runnable()` before running their own body, then drop the returned
//! handle (or call `complete()` explicitly) to release dependents.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::classify::DependencyClass;
use crate::ids::{DocumentId, TaskId, TaskIdGen};

/// Advisory execution priority. Never reorders dependencies; only affects
/// which of several already-runnable tasks acquires a concurrency slot
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Background,
    #[default]
    Normal,
}

/// `dependsOn(earlier, later)` exactly as specified in §4.2.
pub fn depends_on(earlier: &DependencyClass, later: &DependencyClass) -> bool {
    use DependencyClass::*;
    match (earlier, later) {
        (GlobalConfigurationChange, _) => true,
        (_, GlobalConfigurationChange) => true,
        (DocumentUpdate(u), DocumentUpdate(v)) => u == v,
        (DocumentUpdate(_), WorkspaceRequest) => true,
        (WorkspaceRequest, DocumentUpdate(_)) => true,
        (DocumentUpdate(u), DocumentRequest(v)) => u == v,
        (DocumentRequest(u), DocumentUpdate(v)) => u == v,
        _ => false,
    }
}

struct TaskRecord {
    id: TaskId,
    class: DependencyClass,
    waiters: Vec<oneshot::Sender<()>>,
}

struct QueueState {
    // Currently-pending (not yet completed) tasks, oldest first.
    pending: VecDeque<TaskRecord>,
}

struct ConcurrencyGate {
    available: usize,
    unbounded: bool,
    normal_waiters: VecDeque<oneshot::Sender<()>>,
    background_waiters: VecDeque<oneshot::Sender<()>>,
}

impl ConcurrencyGate {
    fn release_one(&mut self) {
        if self.unbounded {
            return;
        }
        // A waiter's receiver can already be gone (its future was cancelled,
        // e.g. by a timeout) without ever consuming a permit; skip those
        // instead of leaking the permit we're trying to hand off.
        while let Some(tx) = self.normal_waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        while let Some(tx) = self.background_waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        self.available += 1;
    }
}

struct Inner {
    state: Mutex<QueueState>,
    gate: Mutex<ConcurrencyGate>,
    id_gen: TaskIdGen,
}

/// The dependency queue. Cheaply cloneable; all instances share the same
/// underlying state.
#[derive(Clone)]
pub struct DependencyQueue(Arc<Inner>);

impl DependencyQueue {
    pub fn new() -> Self {
        Self::with_concurrency_limit(None)
    }

    /// `limit = None` means no concurrency cap is enforced beyond the
    /// dependency relation itself.
    pub fn with_concurrency_limit(limit: Option<usize>) -> Self {
        Self(Arc::new(Inner {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
            }),
            gate: Mutex::new(ConcurrencyGate {
                available: limit.unwrap_or(0),
                unbounded: limit.is_none(),
                normal_waiters: VecDeque::new(),
                background_waiters: VecDeque::new(),
            }),
            id_gen: TaskIdGen::new(),
        }))
    }

    /// Enqueue a task of the given class. The dependency set is computed
    /// against every currently-pending task at the moment of this call, per
    /// §4.2: "On enqueue, the queue computes the set `{E in pending :
    /// dependsOn(E, new)}`."
    pub fn enqueue(&self, class: DependencyClass, priority: Priority) -> Scheduled {
        let id = self.0.id_gen.next();
        let mut waits = Vec::new();
        {
            let mut state = self.0.state.lock();
            for record in state.pending.iter_mut() {
                if depends_on(&record.class, &class) {
                    let (tx, rx) = oneshot::channel();
                    record.waiters.push(tx);
                    waits.push(rx);
                }
            }
            trace!(task = %id, predecessors = waits.len(), ?class, "enqueued task");
            state.pending.push_back(TaskRecord {
                id,
                class,
                waiters: Vec::new(),
            });
        }
        Scheduled {
            queue: self.clone(),
            id,
            priority,
            waits,
            permit_acquired: false,
            completed: false,
        }
    }

    fn complete(&self, id: TaskId) {
        let waiters = {
            let mut state = self.0.state.lock();
            let idx = state.pending.iter().position(|r| r.id == id);
            match idx {
                Some(i) => {
                    let record = state.pending.remove(i).expect("index just found");
                    record.waiters
                }
                None => {
                    // Already removed (double-complete); nothing to do.
                    return;
                }
            }
        };
        trace!(task = %id, released = waiters.len(), "task completed");
        for tx in waiters {
            let _ = tx.send(());
        }
    }

    fn release_permit(&self) {
        self.0.gate.lock().release_one();
    }

    async fn acquire_permit(&self, priority: Priority) {
        let rx = {
            let mut gate = self.0.gate.lock();
            if gate.unbounded {
                return;
            }
            if gate.available > 0 {
                gate.available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                match priority {
                    Priority::Normal => gate.normal_waiters.push_back(tx),
                    Priority::Background => gate.background_waiters.push_back(tx),
                }
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    /// Number of currently-pending (not completed) tasks; exposed for tests
    /// and for the lifecycle orchestrator's shutdown drain.
    pub fn pending_count(&self) -> usize {
        self.0.state.lock().pending.len()
    }

    pub fn documents_with_pending_updates(&self) -> Vec<DocumentId> {
        self.0
            .state
            .lock()
            .pending
            .iter()
            .filter_map(|r| match &r.class {
                DependencyClass::DocumentUpdate(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for DependencyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A task's slot in the queue. Callers must `wait_runnable().await` before
/// running the task body, then either call `complete()` or simply drop this
/// handle (the `Drop` impl completes the task so that a panicking body still
/// releases its dependents, per the §4.2 failure model).
pub struct Scheduled {
    queue: DependencyQueue,
    id: TaskId,
    priority: Priority,
    waits: Vec<oneshot::Receiver<()>>,
    permit_acquired: bool,
    completed: bool,
}

impl Scheduled {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Waits until every predecessor this task depends on has completed,
    /// then acquires a concurrency-gate permit. After this returns, the
    /// caller may run the task body.
    pub async fn wait_runnable(&mut self) {
        for rx in self.waits.drain(..) {
            let _ = rx.await;
        }
        self.queue.acquire_permit(self.priority).await;
        self.permit_acquired = true;
    }

    /// Marks the task complete, releasing dependents and the concurrency
    /// slot. Idempotent.
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if self.permit_acquired {
            self.queue.release_permit();
        }
        self.queue.complete(self.id);
    }
}

impl Drop for Scheduled {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DocumentId;
    use url::Url;

    fn doc(n: &str) -> DocumentId {
        DocumentId::from_url(Url::parse(&format!("file:///{n}")).unwrap())
    }

    #[test]
    fn same_document_updates_serialize() {
        let d = doc("a.rs");
        assert!(depends_on(
            &DependencyClass::DocumentUpdate(d.clone()),
            &DependencyClass::DocumentUpdate(d)
        ));
    }

    #[test]
    fn different_document_updates_are_independent() {
        assert!(!depends_on(
            &DependencyClass::DocumentUpdate(doc("a.rs")),
            &DependencyClass::DocumentUpdate(doc("b.rs"))
        ));
    }

    #[test]
    fn document_requests_on_same_doc_do_not_depend_on_each_other() {
        let d = doc("a.rs");
        assert!(!depends_on(
            &DependencyClass::DocumentRequest(d.clone()),
            &DependencyClass::DocumentRequest(d)
        ));
    }

    #[test]
    fn global_change_depends_on_and_is_depended_on_by_everything() {
        assert!(depends_on(
            &DependencyClass::GlobalConfigurationChange,
            &DependencyClass::Freestanding
        ));
        assert!(depends_on(
            &DependencyClass::Freestanding,
            &DependencyClass::GlobalConfigurationChange
        ));
    }

    #[test]
    fn freestanding_is_independent_of_everything_else() {
        assert!(!depends_on(
            &DependencyClass::DocumentUpdate(doc("a.rs")),
            &DependencyClass::Freestanding
        ));
        assert!(!depends_on(
            &DependencyClass::WorkspaceRequest,
            &DependencyClass::Freestanding
        ));
    }

    #[tokio::test]
    async fn document_update_blocks_later_request_on_same_document() {
        let q = DependencyQueue::new();
        let d = doc("a.rs");

        let mut update = q.enqueue(DependencyClass::DocumentUpdate(d.clone()), Priority::Normal);
        let mut request = q.enqueue(DependencyClass::DocumentRequest(d), Priority::Normal);

        update.wait_runnable().await; // runs immediately, no predecessor

        let request_done = Arc::new(tokio::sync::Notify::new());
        let request_done2 = request_done.clone();
        let handle = tokio::spawn(async move {
            request.wait_runnable().await;
            request_done2.notify_one();
            request.complete();
        });

        // The request must not become runnable before the update completes.
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), request_done.notified())
            .await
            .is_err();
        assert!(timed_out, "request became runnable before the update completed");

        update.complete();
        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("request task to finish after update completes")
            .unwrap();
    }

    #[tokio::test]
    async fn independent_documents_run_concurrently() {
        let q = DependencyQueue::new();
        let mut a = q.enqueue(DependencyClass::DocumentUpdate(doc("a.rs")), Priority::Normal);
        let mut b = q.enqueue(DependencyClass::DocumentRequest(doc("b.rs")), Priority::Normal);

        tokio::time::timeout(std::time::Duration::from_millis(50), async {
            a.wait_runnable().await;
            b.wait_runnable().await;
        })
        .await
        .expect("both independent tasks should become runnable promptly");
    }

    #[tokio::test]
    async fn panicking_body_still_releases_dependents_via_drop() {
        let q = DependencyQueue::new();
        let d = doc("a.rs");
        let mut update = q.enqueue(DependencyClass::DocumentUpdate(d.clone()), Priority::Normal);
        update.wait_runnable().await;
        drop(update); // simulates the task's owning future being dropped/panicking

        let mut request = q.enqueue(DependencyClass::DocumentRequest(d), Priority::Normal);
        tokio::time::timeout(std::time::Duration::from_millis(50), request.wait_runnable())
            .await
            .expect("dependent must be released once the predecessor's handle is dropped");
    }

    #[tokio::test]
    async fn concurrency_cap_limits_simultaneous_runnable_tasks() {
        let q = DependencyQueue::with_concurrency_limit(Some(1));
        let mut a = q.enqueue(DependencyClass::Freestanding, Priority::Normal);
        let mut b = q.enqueue(DependencyClass::Freestanding, Priority::Normal);

        a.wait_runnable().await;
        let b_ready = tokio::time::timeout(std::time::Duration::from_millis(50), b.wait_runnable())
            .await
            .is_ok();
        assert!(!b_ready, "second task should not acquire a permit while the first holds it");

        a.complete();
        tokio::time::timeout(std::time::Duration::from_millis(50), b.wait_runnable())
            .await
            .expect("permit should free up once the first task completes");
    }
}
