//! Possible outcomes of an activity and their live status
//!
//! A [`RuntimeResult`] stands for one way an activity may end. Its status is
//! derived from the engine conditions that prove the outcome, or, for a
//! result built with [`RuntimeResult::and`], from the status of both operands.
//! `Impossible` is final.

use crate::command::{CommandResult, ResultKind};
use crate::control_core::{ConditionStatus, NetHandle, NetId};
use crate::status::{Listener, ListenerId, Observable, StateMachine};
use crate::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// The outcome has been reached
    Active,
    /// Not reached yet, still reachable
    Possible,
    /// Can no longer be reached
    Impossible,
}

impl ResultStatus {
    /// Status of a result reachable only when both operands are
    pub fn combine(self, other: ResultStatus) -> ResultStatus {
        match (self, other) {
            (ResultStatus::Impossible, _) | (_, ResultStatus::Impossible) => ResultStatus::Impossible,
            (ResultStatus::Active, ResultStatus::Active) => ResultStatus::Active,
            _ => ResultStatus::Possible,
        }
    }
}

impl StateMachine for ResultStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, ResultStatus::Impossible)
    }

    fn can_move_to(&self, _next: Self) -> bool {
        !self.is_terminal()
    }
}

impl From<ConditionStatus> for ResultStatus {
    fn from(status: ConditionStatus) -> Self {
        match status {
            ConditionStatus::Active => ResultStatus::Active,
            ConditionStatus::Possible => ResultStatus::Possible,
            ConditionStatus::Impossible => ResultStatus::Impossible,
        }
    }
}

/// Application view of one possible outcome
pub trait ActivityResult: Send + Sync {
    fn status(&self) -> ResultStatus;

    fn is_completed(&self) -> bool;

    fn failure(&self) -> Option<&str>;

    /// Whether a new activity may start from scratch after this outcome
    fn allows_fresh_start(&self) -> bool;

    fn devices(&self) -> &BTreeSet<String>;

    /// Command conditions whose occurrence proves this outcome
    fn conditions(&self) -> &BTreeSet<CommandResult>;

    /// Start tracking the engine conditions; calling it again has no effect
    fn register_status_listener(&self) -> Result<()>;

    fn add_status_listener(&self, listener: Listener<ResultStatus>) -> ListenerId;

    fn remove_status_listener(&self, id: ListenerId) -> bool;
}

#[derive(Default)]
struct Tracking {
    registered: bool,
    active: BTreeSet<CommandResult>,
    impossible: bool,
}

enum Derivation {
    Conditions(Mutex<Tracking>),
    Conjunction(RuntimeResult, RuntimeResult),
}

struct ResultInner {
    completed: bool,
    failure: Option<String>,
    allows_fresh_start: bool,
    devices: BTreeSet<String>,
    conditions: BTreeSet<CommandResult>,
    status: Observable<ResultStatus>,
    derivation: Derivation,
}

impl ResultInner {
    fn update(&self, condition: &CommandResult, status: ConditionStatus) {
        let Derivation::Conditions(tracking) = &self.derivation else {
            return;
        };
        let mut tracking = tracking.lock();
        if tracking.impossible {
            return;
        }
        match status {
            ConditionStatus::Active => {
                tracking.active.insert(condition.clone());
            }
            ConditionStatus::Impossible => tracking.impossible = true,
            ConditionStatus::Possible => {}
        }
        let next = if tracking.impossible {
            ResultStatus::Impossible
        } else if tracking.active.len() == self.conditions.len() {
            ResultStatus::Active
        } else {
            ResultStatus::Possible
        };
        if self.status.set(next) {
            debug!("Result on {:?} is now {:?}", condition, next);
        }
    }

    fn recompute(&self) {
        if let Derivation::Conjunction(left, right) = &self.derivation {
            self.status.set(left.status().combine(right.status()));
        }
    }
}

/// One possible outcome, backed by engine conditions
#[derive(Clone)]
pub struct RuntimeResult {
    inner: Arc<ResultInner>,
}

impl std::fmt::Debug for RuntimeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeResult")
            .field("status", &self.status())
            .field("completed", &self.inner.completed)
            .field("failure", &self.inner.failure)
            .field("devices", &self.inner.devices)
            .field("conditions", &self.inner.conditions)
            .finish()
    }
}

impl RuntimeResult {
    fn build(
        completed: bool,
        failure: Option<String>,
        allows_fresh_start: bool,
        devices: &[&str],
        conditions: Vec<CommandResult>,
    ) -> Self {
        let conditions: BTreeSet<CommandResult> = conditions.into_iter().collect();
        let initial = if conditions.is_empty() {
            ResultStatus::Active
        } else {
            ResultStatus::Possible
        };
        Self {
            inner: Arc::new(ResultInner {
                completed,
                failure,
                allows_fresh_start,
                devices: devices.iter().map(|d| d.to_string()).collect(),
                conditions,
                status: Observable::new(initial),
                derivation: Derivation::Conditions(Mutex::new(Tracking::default())),
            }),
        }
    }

    /// The activity ended normally
    pub fn completion(conditions: Vec<CommandResult>, devices: &[&str]) -> Self {
        Self::build(true, None, true, devices, conditions)
    }

    /// The activity ended on request before finishing
    pub fn cancellation(conditions: Vec<CommandResult>, devices: &[&str]) -> Self {
        Self::build(true, None, true, devices, conditions)
    }

    pub fn failure(reason: &str, conditions: Vec<CommandResult>, devices: &[&str]) -> Self {
        Self::build(true, Some(reason.to_string()), false, devices, conditions)
    }

    /// A state reached while the activity keeps running
    pub fn intermediate(conditions: Vec<CommandResult>, devices: &[&str]) -> Self {
        Self::build(false, None, false, devices, conditions)
    }

    /// Idle devices with nothing running; already reached
    pub fn fresh(devices: &[&str]) -> Self {
        Self::build(true, None, true, devices, Vec::new())
    }

    /// Outcome reached exactly when both `self` and `other` are
    pub fn and(&self, other: &RuntimeResult) -> RuntimeResult {
        let (left, right) = (&self.inner, &other.inner);
        let combined = RuntimeResult {
            inner: Arc::new(ResultInner {
                completed: left.completed && right.completed,
                failure: left.failure.clone().or_else(|| right.failure.clone()),
                allows_fresh_start: left.allows_fresh_start && right.allows_fresh_start,
                devices: left.devices.union(&right.devices).cloned().collect(),
                conditions: left.conditions.union(&right.conditions).cloned().collect(),
                status: Observable::new(self.status().combine(other.status())),
                derivation: Derivation::Conjunction(self.clone(), other.clone()),
            }),
        };
        for operand in [self, other] {
            let weak: Weak<ResultInner> = Arc::downgrade(&combined.inner);
            operand.inner.status.add_listener(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.recompute();
                }
            });
        }
        // an operand may have moved while the listeners were attached
        combined.inner.recompute();
        combined
    }

    /// Whether every backing condition proves a cancellation
    pub fn is_cancellation(&self) -> bool {
        !self.inner.conditions.is_empty()
            && self
                .inner
                .conditions
                .iter()
                .all(|c| c.kind() == ResultKind::Cancellation)
    }

    pub fn add_listener(&self, listener: impl Fn(ResultStatus) + Send + Sync + 'static) -> ListenerId {
        self.inner.status.add_listener(listener)
    }

    pub async fn wait_for(&self, status: ResultStatus) -> ResultStatus {
        self.inner
            .status
            .wait_for(|s| *s == status || s.is_terminal())
            .await
    }

    pub(crate) fn set_status(&self, status: ResultStatus) -> bool {
        self.inner.status.set(status)
    }

    /// Loaded nets backing the conditions, one entry per net
    fn backing_nets(&self) -> Result<BTreeMap<NetId, (Arc<dyn NetHandle>, Vec<CommandResult>)>> {
        let mut nets: BTreeMap<NetId, (Arc<dyn NetHandle>, Vec<CommandResult>)> = BTreeMap::new();
        for condition in &self.inner.conditions {
            let handle = condition.handle()?;
            nets.entry(handle.id())
                .or_insert_with(|| (handle.net().clone(), Vec::new()))
                .1
                .push(condition.clone());
        }
        Ok(nets)
    }
}

impl ActivityResult for RuntimeResult {
    fn status(&self) -> ResultStatus {
        self.inner.status.get()
    }

    fn is_completed(&self) -> bool {
        self.inner.completed
    }

    fn failure(&self) -> Option<&str> {
        self.inner.failure.as_deref()
    }

    fn allows_fresh_start(&self) -> bool {
        self.inner.allows_fresh_start
    }

    fn devices(&self) -> &BTreeSet<String> {
        &self.inner.devices
    }

    fn conditions(&self) -> &BTreeSet<CommandResult> {
        &self.inner.conditions
    }

    fn register_status_listener(&self) -> Result<()> {
        let tracking = match &self.inner.derivation {
            Derivation::Conjunction(left, right) => {
                left.register_status_listener()?;
                return right.register_status_listener();
            }
            Derivation::Conditions(tracking) => tracking,
        };
        let nets = {
            let mut tracking = tracking.lock();
            if tracking.registered {
                return Ok(());
            }
            let nets = self.backing_nets()?;
            tracking.registered = true;
            nets
        };

        for (net, conditions) in nets.values() {
            let weak = Arc::downgrade(&self.inner);
            let watched = conditions.clone();
            net.add_condition_listener(Arc::new(move |name: &str, status: ConditionStatus| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                for condition in watched.iter().filter(|c| c.condition() == name) {
                    inner.update(condition, status);
                }
            }));
            for condition in conditions {
                if let Some(status) = net.condition_status(condition.condition()) {
                    self.inner.update(condition, status);
                }
            }
        }
        Ok(())
    }

    fn add_status_listener(&self, listener: Listener<ResultStatus>) -> ListenerId {
        self.inner.status.add_shared_listener(listener, false)
    }

    fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.inner.status.remove_listener(id)
    }
}
