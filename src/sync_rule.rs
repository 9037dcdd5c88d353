//! Synchronization rules installed on the control core
//!
//! A rule waits for a set of net conditions and then, within one engine
//! cycle, stops, cancels and starts nets. Its status starts `Active` and ends
//! in exactly one terminal status. A listener attached after that receives the
//! terminal status once, synchronously, when it is attached.

use crate::control_core::{NetId, NetResult};
use crate::status::{ListenerId, Observable, StateMachine};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// Waiting for its conditions
    Active,
    /// Conditions met and all actions performed
    Fired,
    /// Conditions met but the actions failed
    FireFailed,
    /// Superseded, or its conditions can no longer occur
    Inactive,
    /// Could not be installed
    Invalid,
}

impl StateMachine for RuleStatus {
    fn is_terminal(&self) -> bool {
        !matches!(self, RuleStatus::Active)
    }

    fn can_move_to(&self, _next: Self) -> bool {
        matches!(self, RuleStatus::Active)
    }
}

static NEXT_RULE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct NetSynchronizationRule {
    id: u64,
    conditions: Vec<NetResult>,
    stop: Vec<NetId>,
    cancel: Vec<NetId>,
    start: Vec<NetId>,
    status: Observable<RuleStatus>,
}

impl NetSynchronizationRule {
    pub fn new(conditions: Vec<NetResult>, stop: Vec<NetId>, cancel: Vec<NetId>, start: Vec<NetId>) -> Self {
        Self {
            id: NEXT_RULE_ID.fetch_add(1, Ordering::Relaxed),
            conditions,
            stop,
            cancel,
            start,
            status: Observable::new(RuleStatus::Active),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conditions(&self) -> &[NetResult] {
        &self.conditions
    }

    pub fn stop_nets(&self) -> &[NetId] {
        &self.stop
    }

    pub fn cancel_nets(&self) -> &[NetId] {
        &self.cancel
    }

    pub fn start_nets(&self) -> &[NetId] {
        &self.start
    }

    /// Whether this rule acts on `net` in any way
    pub fn touches(&self, net: NetId) -> bool {
        self.stop.contains(&net) || self.cancel.contains(&net) || self.start.contains(&net)
    }

    pub fn status(&self) -> RuleStatus {
        self.status.get()
    }

    pub fn add_listener(&self, listener: impl Fn(RuleStatus) + Send + Sync + 'static) -> ListenerId {
        self.status.add_listener_with_replay(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.status.remove_listener(id)
    }

    /// Engine side: the conditions occurred and the actions ran
    pub fn fire(&self, succeeded: bool) -> bool {
        let status = if succeeded {
            RuleStatus::Fired
        } else {
            RuleStatus::FireFailed
        };
        self.transition(status)
    }

    /// Engine side: replaced by a newer rule, or unreachable
    pub fn supersede(&self) -> bool {
        self.transition(RuleStatus::Inactive)
    }

    /// Engine side: installation failed
    pub fn invalidate(&self) -> bool {
        self.transition(RuleStatus::Invalid)
    }

    fn transition(&self, status: RuleStatus) -> bool {
        let moved = self.status.set(status);
        if moved {
            debug!("Rule {} is now {:?}", self.id, status);
        }
        moved
    }

    pub async fn wait(&self) -> RuleStatus {
        self.status.wait_terminal().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn rule() -> NetSynchronizationRule {
        NetSynchronizationRule::new(
            vec![NetResult::new(NetId(1), "completed")],
            vec![NetId(1)],
            Vec::new(),
            vec![NetId(2)],
        )
    }

    #[test]
    fn test_subscribe_before_terminal() {
        let rule = rule();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rule.add_listener(move |status| sink.lock().push(status));
        assert!(seen.lock().is_empty());

        assert!(rule.fire(true));
        assert!(!rule.supersede());
        assert_eq!(*seen.lock(), vec![RuleStatus::Fired]);
    }

    #[test]
    fn test_subscribe_after_terminal_replays_once() {
        let rule = rule();
        rule.fire(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rule.add_listener(move |status| sink.lock().push(status));
        assert_eq!(*seen.lock(), vec![RuleStatus::FireFailed]);
        assert!(!rule.invalidate());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_detached_listener_is_silent() {
        let rule = rule();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = rule.add_listener(move |status| sink.lock().push(status));
        assert!(rule.remove_listener(id));
        rule.supersede();
        assert!(seen.lock().is_empty());
        assert_eq!(rule.status(), RuleStatus::Inactive);
        assert!(rule.touches(NetId(2)));
        assert!(!rule.touches(NetId(3)));
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_status() {
        let rule = Arc::new(rule());
        let engine = rule.clone();
        tokio::spawn(async move {
            engine.invalidate();
        });
        assert_eq!(rule.wait().await, RuleStatus::Invalid);
    }
}
