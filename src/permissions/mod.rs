//! Permission broker.
//!
//! Suspends a task runner's tool-permission check until an operator answers
//! it from the UI. Each request gets a fresh permission ID and a one-shot
//! channel; the request is published as [`UiEvent::PermissionRequested`] and
//! the caller waits on whichever comes first: the operator's answer, its own
//! cancellation token, or a run-wide resolution ([`PermissionBroker::end_run`],
//! [`PermissionBroker::shutdown`]).
//!
//! Every pending entry is removed from the map by exactly one resolver, and
//! the winner sends on the one-shot while still holding the map lock, so a
//! request is answered exactly once. A caller whose future is dropped
//! mid-wait withdraws its entry the same way a cancelled one does.
//!
//! After [`PermissionBroker::shutdown`] the broker is closed and every new
//! request is denied without being registered.

pub mod decision;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use decision::{
    Behavior, PermissionDecision, PermissionRequest, PermissionResponse, PermissionResult,
    CANCELLED_MESSAGE, DEFAULT_DENY_MESSAGE, NO_BOUNDARY_MESSAGE, RUN_ENDED_MESSAGE,
};

use crate::events::{EventSender, UiEvent};

struct PendingPermission {
    tool_use_id: String,
    run_id: Option<String>,
    tx: oneshot::Sender<PermissionDecision>,
}

type PendingMap = HashMap<String, PendingPermission>;

struct BrokerInner {
    pending: Mutex<PendingMap>,
    events: EventSender,
    /// Set under the `pending` lock by `shutdown`.
    closed: AtomicBool,
}

impl BrokerInner {
    fn announce(&self, permission_id: &str, tool_use_id: &str, decision: &PermissionDecision) {
        let _ = self.events.send(UiEvent::PermissionResolved {
            permission_id: permission_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            behavior: decision.behavior(),
        });
    }

    /// Remove an entry whose caller stopped waiting and tell the UIs.
    fn withdraw(
        &self,
        pending: &mut PendingMap,
        permission_id: &str,
    ) -> Option<PermissionDecision> {
        let entry = pending.remove(permission_id)?;
        debug!("Permission {permission_id} cancelled by caller");
        let decision = PermissionDecision::deny_and_interrupt(CANCELLED_MESSAGE);
        self.announce(permission_id, &entry.tool_use_id, &decision);
        Some(decision)
    }
}

/// Withdraws a registered request if `decide` is dropped before it returns.
struct WithdrawOnDrop {
    inner: Arc<BrokerInner>,
    permission_id: Option<String>,
}

impl WithdrawOnDrop {
    fn disarm(mut self) {
        self.permission_id = None;
    }
}

impl Drop for WithdrawOnDrop {
    fn drop(&mut self) {
        let Some(permission_id) = self.permission_id.take() else {
            return;
        };
        if let Ok(mut pending) = self.inner.pending.try_lock() {
            self.inner.withdraw(&mut pending, &permission_id);
            return;
        }
        let inner = Arc::clone(&self.inner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut pending = inner.pending.lock().await;
                inner.withdraw(&mut pending, &permission_id);
            });
        } else {
            warn!("Permission {permission_id} abandoned outside a runtime, left pending");
        }
    }
}

#[derive(Clone)]
pub struct PermissionBroker {
    inner: Arc<BrokerInner>,
}

impl PermissionBroker {
    pub fn new(events: EventSender) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                pending: Mutex::new(HashMap::new()),
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Ask the operator about one tool invocation and wait for the answer.
    ///
    /// Denies without registering anything when `cancel` has already fired,
    /// when the broker has shut down, or when no UI is subscribed to the
    /// event channel.
    pub async fn request(
        &self,
        req: PermissionRequest,
        cancel: CancellationToken,
    ) -> PermissionResult {
        let tool_use_id = req.tool_use_id.clone();
        let decision = self.decide(req, cancel).await;
        PermissionResult {
            tool_use_id,
            decision,
        }
    }

    async fn decide(&self, req: PermissionRequest, cancel: CancellationToken) -> PermissionDecision {
        if cancel.is_cancelled() {
            debug!("Permission request for {} already cancelled", req.tool_use_id);
            return PermissionDecision::deny_and_interrupt(CANCELLED_MESSAGE);
        }
        if self.is_closed() {
            debug!("Broker closed, denying {}", req.tool_use_id);
            return PermissionDecision::deny_and_interrupt(RUN_ENDED_MESSAGE);
        }
        if self.inner.events.receiver_count() == 0 {
            warn!(
                "No UI connected, denying {} ({})",
                req.tool_name, req.tool_use_id
            );
            return PermissionDecision::deny(NO_BOUNDARY_MESSAGE);
        }

        let permission_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            // Recheck under the lock so nothing registers after shutdown drained.
            if self.is_closed() {
                return PermissionDecision::deny_and_interrupt(RUN_ENDED_MESSAGE);
            }
            if pending.values().any(|p| p.tool_use_id == req.tool_use_id) {
                warn!(
                    "Tool use {} already has a pending permission request",
                    req.tool_use_id
                );
            }
            pending.insert(
                permission_id.clone(),
                PendingPermission {
                    tool_use_id: req.tool_use_id.clone(),
                    run_id: req.run_id.clone(),
                    tx,
                },
            );
        }
        let guard = WithdrawOnDrop {
            inner: Arc::clone(&self.inner),
            permission_id: Some(permission_id.clone()),
        };

        info!(
            "Permission {permission_id} requested for {} ({})",
            req.tool_name, req.tool_use_id
        );
        let published = self.inner.events.send(UiEvent::PermissionRequested {
            permission_id: permission_id.clone(),
            tool_name: req.tool_name,
            input: req.input,
            tool_use_id: req.tool_use_id,
            run_id: req.run_id,
            decision_reason: req.decision_reason,
            blocked_path: req.blocked_path,
            suggestions: req.suggestions,
        });
        if published.is_err() {
            // The last UI went away between the check and the send.
            self.inner.pending.lock().await.remove(&permission_id);
            guard.disarm();
            return PermissionDecision::deny(NO_BOUNDARY_MESSAGE);
        }

        let decision = tokio::select! {
            answer = &mut rx => {
                answer.unwrap_or_else(|_| PermissionDecision::deny_and_interrupt(RUN_ENDED_MESSAGE))
            }
            () = cancel.cancelled() => {
                let mut pending = self.inner.pending.lock().await;
                match self.inner.withdraw(&mut pending, &permission_id) {
                    Some(decision) => decision,
                    // Another resolver won and already sent under the lock.
                    None => rx
                        .try_recv()
                        .unwrap_or_else(|_| PermissionDecision::deny_and_interrupt(CANCELLED_MESSAGE)),
                }
            }
        };
        guard.disarm();
        decision
    }

    /// Deliver the operator's answer. Returns `false` when the ID is unknown
    /// or was already resolved.
    pub async fn resolve(&self, permission_id: &str, response: PermissionResponse) -> bool {
        let mut pending = self.inner.pending.lock().await;
        let Some(entry) = pending.remove(permission_id) else {
            debug!("Permission {permission_id} is not pending");
            return false;
        };
        let decision = response.into_decision();
        info!("Permission {permission_id} resolved: {}", decision.behavior());
        self.settle(permission_id, &entry.tool_use_id, entry.tx, decision);
        drop(pending);
        true
    }

    /// Deny every pending request that belongs to `run_id`.
    pub async fn end_run(&self, run_id: &str) -> usize {
        let mut pending = self.inner.pending.lock().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.run_id.as_deref() == Some(run_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                self.settle(
                    id,
                    &entry.tool_use_id,
                    entry.tx,
                    PermissionDecision::deny_and_interrupt(RUN_ENDED_MESSAGE),
                );
            }
        }
        if !ids.is_empty() {
            info!("Run {run_id} ended, denied {} pending permission(s)", ids.len());
        }
        ids.len()
    }

    /// Deny every pending request, leave the map empty and refuse new ones.
    pub async fn shutdown(&self) -> usize {
        let mut pending = self.inner.pending.lock().await;
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<(String, PendingPermission)> = pending.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            self.settle(
                &id,
                &entry.tool_use_id,
                entry.tx,
                PermissionDecision::deny_and_interrupt(RUN_ENDED_MESSAGE),
            );
        }
        if count > 0 {
            info!("Denied {count} pending permission(s) on shutdown");
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send the decision to the waiting caller and tell the UIs it is settled.
    /// Callers hold the pending lock.
    fn settle(
        &self,
        permission_id: &str,
        tool_use_id: &str,
        tx: oneshot::Sender<PermissionDecision>,
        decision: PermissionDecision,
    ) {
        self.inner.announce(permission_id, tool_use_id, &decision);
        let _ = tx.send(decision);
    }
}
