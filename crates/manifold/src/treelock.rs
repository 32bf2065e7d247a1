//! Per-working-tree lock manager.
//!
//! Many in-flight requests want different revisions of the same repository
//! checked out into the same directory. The manager serializes what a tree
//! holds: requests for the revision currently checked out share the tree,
//! requests for a different revision wait for the holders to drain and then
//! run their checkout under an exclusive ticket. Waiters are admitted in
//! FIFO order; a waiter abandoned mid-wait (request cancelled) leaves the
//! queue without stalling it.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::Notify;
use tracing::debug;

/// Lock table keyed by tree root. One per process.
#[derive(Default)]
pub struct TreeLocks {
    trees: Mutex<HashMap<PathBuf, Arc<TreeState>>>,
}

struct TreeState {
    inner: Mutex<TreeInner>,
    notify: Notify,
}

struct TreeInner {
    /// Revision currently checked out, if any checkout ever succeeded.
    revision: Option<String>,
    /// Active holders.
    readers: usize,
    /// Holders (or an in-flight checkout) have exclusive access.
    exclusive: bool,
    /// Waiting tickets, front is next to be admitted.
    queue: VecDeque<u64>,
    next_ticket: u64,
    /// Checkouts that actually ran; observable for tests and metrics.
    checkouts: u64,
}

enum Admission {
    /// Tree is free and already holds the revision.
    Reuse,
    /// Tree is free but holds a different revision; run the checkout.
    Checkout,
    /// Join the current holders at the same revision.
    Share,
}

/// Shared handle on a locked tree. Release is idempotent; dropping the
/// guard releases as a fallback so cancelled requests cannot strand the
/// tree.
pub struct TreeGuard {
    state: Arc<TreeState>,
    released: bool,
}

impl TreeGuard {
    /// Release this holder, waking waiters in FIFO order.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut inner = self.state.inner.lock().expect("tree lock poisoned");
        inner.readers = inner.readers.saturating_sub(1);
        if inner.readers == 0 {
            inner.exclusive = false;
        }
        drop(inner);
        self.state.notify.notify_waiters();
    }
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for TreeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeGuard")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// Removes an abandoned ticket from the queue.
struct TicketGuard {
    state: Arc<TreeState>,
    ticket: u64,
    admitted: bool,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let mut inner = self.state.inner.lock().expect("tree lock poisoned");
        inner.queue.retain(|t| *t != self.ticket);
        drop(inner);
        self.state.notify.notify_waiters();
    }
}

/// Rolls the tree back if the caller is cancelled mid-checkout.
struct CheckoutRollback {
    state: Arc<TreeState>,
    armed: bool,
}

impl Drop for CheckoutRollback {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.state.inner.lock().expect("tree lock poisoned");
        inner.readers = 0;
        inner.exclusive = false;
        drop(inner);
        self.state.notify.notify_waiters();
    }
}

impl TreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_for(&self, root: &Path) -> Arc<TreeState> {
        let mut trees = self.trees.lock().expect("tree table poisoned");
        trees
            .entry(root.to_path_buf())
            .or_insert_with(|| {
                Arc::new(TreeState {
                    inner: Mutex::new(TreeInner {
                        revision: None,
                        readers: 0,
                        exclusive: false,
                        queue: VecDeque::new(),
                        next_ticket: 0,
                        checkouts: 0,
                    }),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Lock `root` for `revision`. When the tree holds a different revision
    /// the caller blocks until current holders release and then `checkout`
    /// runs; at most one checkout runs per root at a time. A failed
    /// checkout restores the previous state and the error propagates to
    /// this caller only.
    pub async fn lock<F, Fut>(
        &self,
        root: &Path,
        revision: &str,
        allow_concurrent: bool,
        checkout: F,
    ) -> Result<TreeGuard>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let state = self.state_for(root);

        let ticket = {
            let mut inner = state.inner.lock().expect("tree lock poisoned");
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.queue.push_back(ticket);
            ticket
        };
        let mut ticket_guard = TicketGuard {
            state: state.clone(),
            ticket,
            admitted: false,
        };

        let admission = loop {
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let decision = {
                let mut inner = state.inner.lock().expect("tree lock poisoned");
                if inner.queue.front() != Some(&ticket) {
                    None
                } else if inner.readers == 0 {
                    inner.queue.pop_front();
                    if inner.revision.as_deref() == Some(revision) {
                        inner.readers = 1;
                        inner.exclusive = !allow_concurrent;
                        Some(Admission::Reuse)
                    } else {
                        // Checkout runs under exclusive access.
                        inner.readers = 1;
                        inner.exclusive = true;
                        Some(Admission::Checkout)
                    }
                } else if !inner.exclusive
                    && allow_concurrent
                    && inner.revision.as_deref() == Some(revision)
                {
                    inner.queue.pop_front();
                    inner.readers += 1;
                    Some(Admission::Share)
                } else {
                    None
                }
            };

            match decision {
                Some(admission) => break admission,
                None => notified.await,
            }
        };
        ticket_guard.admitted = true;
        drop(ticket_guard);

        if let Admission::Checkout = admission {
            debug!(root = %root.display(), revision, "switching working tree revision");
            let mut rollback = CheckoutRollback {
                state: state.clone(),
                armed: true,
            };
            match checkout().await {
                Ok(()) => {
                    rollback.armed = false;
                    let mut inner = state.inner.lock().expect("tree lock poisoned");
                    inner.revision = Some(revision.to_string());
                    inner.exclusive = !allow_concurrent;
                    inner.checkouts += 1;
                    drop(inner);
                    state.notify.notify_waiters();
                }
                Err(e) => {
                    // The rollback guard restores the previous state.
                    drop(rollback);
                    return Err(e);
                }
            }
        }

        Ok(TreeGuard {
            state,
            released: false,
        })
    }

    /// The revision a tree currently holds, if any.
    pub fn current_revision(&self, root: &Path) -> Option<String> {
        let trees = self.trees.lock().expect("tree table poisoned");
        let state = trees.get(root)?;
        let inner = state.inner.lock().expect("tree lock poisoned");
        inner.revision.clone()
    }

    /// Checkouts that have run for a tree. Zero for unknown trees.
    pub fn checkout_count(&self, root: &Path) -> u64 {
        let trees = self.trees.lock().expect("tree table poisoned");
        trees
            .get(root)
            .map(|state| state.inner.lock().expect("tree lock poisoned").checkouts)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn root() -> PathBuf {
        PathBuf::from("/scratch/tree-a")
    }

    #[tokio::test]
    async fn first_lock_runs_checkout() {
        let locks = TreeLocks::new();
        let ran = AtomicUsize::new(0);
        let guard = locks
            .lock(&root(), "rev1", true, || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .expect("lock");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(locks.current_revision(&root()), Some("rev1".to_string()));
        drop(guard);
    }

    #[tokio::test]
    async fn same_revision_reuses_tree_without_checkout() {
        let locks = TreeLocks::new();
        let g1 = locks
            .lock(&root(), "rev1", true, || async { Ok(()) })
            .await
            .expect("first");
        drop(g1);
        let g2 = locks
            .lock(&root(), "rev1", true, || async {
                panic!("checkout must not run for a matching revision")
            })
            .await
            .expect("second");
        drop(g2);
        assert_eq!(locks.checkout_count(&root()), 1);
    }

    #[tokio::test]
    async fn concurrent_same_revision_shares() {
        let locks = Arc::new(TreeLocks::new());
        let g1 = locks
            .lock(&root(), "rev1", true, || async { Ok(()) })
            .await
            .expect("first");
        // Second holder joins while the first is still held.
        let g2 = locks
            .lock(&root(), "rev1", true, || async {
                panic!("checkout must not run")
            })
            .await
            .expect("second");
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn different_revision_waits_for_release() {
        let locks = Arc::new(TreeLocks::new());
        let mut g1 = locks
            .lock(&root(), "rev1", true, || async { Ok(()) })
            .await
            .expect("first");

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .lock(&root(), "rev2", true, || async { Ok(()) })
                .await
                .expect("second lock")
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "conflicting lock must wait");

        g1.release();
        let g2 = waiter.await.expect("join");
        assert_eq!(locks.current_revision(&root()), Some("rev2".to_string()));
        drop(g2);
    }

    #[tokio::test]
    async fn non_concurrent_serializes_same_revision() {
        let locks = Arc::new(TreeLocks::new());
        let mut g1 = locks
            .lock(&root(), "rev1", false, || async { Ok(()) })
            .await
            .expect("first");

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .lock(&root(), "rev1", false, || async { Ok(()) })
                .await
                .expect("second")
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "exclusive holder blocks sharing");

        g1.release();
        drop(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn failed_checkout_restores_previous_state() {
        let locks = TreeLocks::new();
        let g = locks
            .lock(&root(), "rev1", true, || async { Ok(()) })
            .await
            .expect("first");
        drop(g);

        let err = locks
            .lock(&root(), "rev2", true, || async {
                anyhow::bail!("checkout exploded")
            })
            .await
            .expect_err("checkout failure propagates");
        assert!(err.to_string().contains("checkout exploded"));
        // Previous revision survives and the tree is lockable again.
        assert_eq!(locks.current_revision(&root()), Some("rev1".to_string()));
        let g = locks
            .lock(&root(), "rev1", true, || async {
                panic!("rev1 is still checked out")
            })
            .await
            .expect("relock");
        drop(g);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let locks = TreeLocks::new();
        let mut g = locks
            .lock(&root(), "rev1", true, || async { Ok(()) })
            .await
            .expect("lock");
        g.release();
        g.release();
        drop(g);
        // Tree is free for a conflicting revision immediately.
        let g2 = locks
            .lock(&root(), "rev2", true, || async { Ok(()) })
            .await
            .expect("relock");
        drop(g2);
    }

    #[tokio::test]
    async fn waiters_admit_in_fifo_order() {
        let locks = Arc::new(TreeLocks::new());
        let mut g = locks
            .lock(&root(), "rev0", false, || async { Ok(()) })
            .await
            .expect("initial");

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4u32 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let rev = format!("rev{}", i + 1);
                let guard = locks
                    .lock(&root(), &rev, false, || async { Ok(()) })
                    .await
                    .expect("lock");
                order.lock().expect("order").push(i);
                drop(guard);
            }));
            // Give each task time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        g.release();
        for h in handles {
            h.await.expect("join");
        }
        assert_eq!(*order.lock().expect("order"), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_stall_queue() {
        let locks = Arc::new(TreeLocks::new());
        let mut g = locks
            .lock(&root(), "rev1", false, || async { Ok(()) })
            .await
            .expect("initial");

        let locks2 = locks.clone();
        let cancelled = tokio::spawn(async move {
            let _ = locks2.lock(&root(), "rev2", false, || async { Ok(()) }).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancelled.abort();
        let _ = cancelled.await;

        g.release();
        // The queue must have dropped the aborted ticket.
        let g2 = locks
            .lock(&root(), "rev3", false, || async { Ok(()) })
            .await
            .expect("third");
        drop(g2);
    }
}
