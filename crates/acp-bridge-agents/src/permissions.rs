// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inverted permission callbacks.
//!
//! ACP permission requests block the agent over stdio until the bridge
//! answers. The supervisor parks each request on the agent's queue with a
//! one-shot resolver; the operations here are what an HTTP caller later uses
//! to complete them. Resolution is strictly FIFO: approve and deny always
//! act on the head of the queue.

use crate::record::{AgentHandle, PendingPermission, PermissionDecision};
use acp_bridge_types::{BridgeError, BridgeResult};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide monotonic permission request id. Observability only; the
/// agent never sees it.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outcome of an approve/deny call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPermission {
    pub request_id: u64,
    pub option_id: String,
}

fn pick_option(pending: &PendingPermission, requested: Option<&str>, prefix: &str) -> String {
    if let Some(id) = requested {
        if pending.options.iter().any(|opt| opt.option_id == id) {
            return id.to_string();
        }
    }
    pending
        .options
        .iter()
        .find(|opt| opt.kind.starts_with(prefix))
        .or_else(|| pending.options.first())
        .map(|opt| opt.option_id.clone())
        .unwrap_or_default()
}

fn resolve_head(
    handle: &AgentHandle,
    requested: Option<&str>,
    prefix: &str,
) -> BridgeResult<ResolvedPermission> {
    let (pending, option_id) = {
        let mut state = handle.lock_state();
        let Some(pending) = state.pending.pop_front() else {
            return Err(BridgeError::NoPendingPermissions);
        };
        let option_id = pick_option(&pending, requested, prefix);
        state.touch();
        (pending, option_id)
    };
    let request_id = pending.request_id;
    let _ = pending
        .resolver
        .send(PermissionDecision::Selected(option_id.clone()));
    Ok(ResolvedPermission {
        request_id,
        option_id,
    })
}

/// Approve the head request. An explicit `option_id` wins when it matches an
/// advertised option; otherwise the first `allow`-kind option, then the first
/// option overall.
pub fn approve(handle: &AgentHandle, option_id: Option<&str>) -> BridgeResult<ResolvedPermission> {
    resolve_head(handle, option_id, "allow")
}

/// Deny the head request, preferring `reject`-kind options.
pub fn deny(handle: &AgentHandle, option_id: Option<&str>) -> BridgeResult<ResolvedPermission> {
    resolve_head(handle, option_id, "reject")
}

/// Resolve every queued request as cancelled. Idempotent; returns the number
/// of requests resolved.
pub fn cancel_all(handle: &AgentHandle) -> usize {
    let drained: Vec<PendingPermission> = {
        let mut state = handle.lock_state();
        if state.pending.is_empty() {
            return 0;
        }
        let drained = state.pending.drain(..).collect();
        state.touch();
        drained
    };
    let count = drained.len();
    for pending in drained {
        let _ = pending.resolver.send(PermissionDecision::Cancelled);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::detached_handle;
    use acp_bridge_types::{AgentType, PermissionChoice};
    use chrono::Utc;
    use tokio::sync::oneshot;

    fn enqueue(
        handle: &AgentHandle,
        options: &[(&str, &str)],
    ) -> (u64, oneshot::Receiver<PermissionDecision>) {
        let (tx, rx) = oneshot::channel();
        let request_id = next_request_id();
        handle.lock_state().pending.push_back(PendingPermission {
            request_id,
            tool_call: serde_json::json!({"title": "run command"}),
            options: options
                .iter()
                .map(|(id, kind)| PermissionChoice {
                    option_id: id.to_string(),
                    name: id.to_string(),
                    kind: kind.to_string(),
                })
                .collect(),
            requested_at: Utc::now(),
            resolver: tx,
        });
        (request_id, rx)
    }

    #[test]
    fn approve_prefers_allow_kind() {
        let handle = detached_handle("a", AgentType::Claude);
        let (id, mut rx) = enqueue(
            &handle,
            &[("reject-1", "reject_once"), ("allow-1", "allow_once")],
        );

        let resolved = approve(&handle, None).unwrap();
        assert_eq!(resolved.request_id, id);
        assert_eq!(resolved.option_id, "allow-1");
        assert_eq!(
            rx.try_recv().unwrap(),
            PermissionDecision::Selected("allow-1".to_string())
        );
    }

    #[test]
    fn deny_prefers_reject_kind() {
        let handle = detached_handle("a", AgentType::Claude);
        let (_, mut rx) = enqueue(
            &handle,
            &[("allow-1", "allow_always"), ("reject-1", "reject_once")],
        );

        let resolved = deny(&handle, None).unwrap();
        assert_eq!(resolved.option_id, "reject-1");
        assert_eq!(
            rx.try_recv().unwrap(),
            PermissionDecision::Selected("reject-1".to_string())
        );
    }

    #[test]
    fn explicit_option_id_wins_when_advertised() {
        let handle = detached_handle("a", AgentType::Claude);
        let (_, _rx) = enqueue(
            &handle,
            &[("allow-1", "allow_once"), ("allow-2", "allow_always")],
        );
        let resolved = approve(&handle, Some("allow-2")).unwrap();
        assert_eq!(resolved.option_id, "allow-2");
    }

    #[test]
    fn unknown_option_id_falls_back_to_kind_preference() {
        let handle = detached_handle("a", AgentType::Claude);
        let (_, _rx) = enqueue(
            &handle,
            &[("reject-1", "reject_once"), ("allow-1", "allow_once")],
        );
        let resolved = approve(&handle, Some("nope")).unwrap();
        assert_eq!(resolved.option_id, "allow-1");
    }

    #[test]
    fn no_kind_match_falls_back_to_first_option() {
        let handle = detached_handle("a", AgentType::Claude);
        let (_, _rx) = enqueue(&handle, &[("opt-1", "other"), ("opt-2", "other")]);
        let resolved = approve(&handle, None).unwrap();
        assert_eq!(resolved.option_id, "opt-1");
    }

    #[test]
    fn resolution_is_fifo() {
        let handle = detached_handle("a", AgentType::Claude);
        let (first, _rx1) = enqueue(&handle, &[("allow-1", "allow_once")]);
        let (second, _rx2) = enqueue(&handle, &[("allow-2", "allow_once")]);

        assert_eq!(approve(&handle, None).unwrap().request_id, first);
        assert_eq!(approve(&handle, None).unwrap().request_id, second);
    }

    #[test]
    fn empty_queue_is_a_conflict_and_leaves_state_alone() {
        let handle = detached_handle("a", AgentType::Claude);
        let before = handle.lock_state().updated_at;
        assert!(matches!(
            approve(&handle, None),
            Err(BridgeError::NoPendingPermissions)
        ));
        assert!(matches!(
            deny(&handle, None),
            Err(BridgeError::NoPendingPermissions)
        ));
        assert_eq!(handle.lock_state().updated_at, before);
    }

    #[test]
    fn cancel_all_is_idempotent() {
        let handle = detached_handle("a", AgentType::Claude);
        let (_, mut rx1) = enqueue(&handle, &[("allow-1", "allow_once")]);
        let (_, mut rx2) = enqueue(&handle, &[("allow-2", "allow_once")]);

        assert_eq!(cancel_all(&handle), 2);
        assert_eq!(rx1.try_recv().unwrap(), PermissionDecision::Cancelled);
        assert_eq!(rx2.try_recv().unwrap(), PermissionDecision::Cancelled);
        assert_eq!(cancel_all(&handle), 0);
    }

    #[test]
    fn request_ids_are_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
