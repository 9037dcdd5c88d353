//! Boundary to the external control core
//!
//! The control core executes nets as cyclic real-time loops. Everything here
//! is a remote view of engine state: a [`NetHandle`] refers to one loaded net
//! and reports its status and conditions through listeners that the engine
//! invokes on its single dispatch thread. Listener bodies must return quickly
//! and must never wait for application-side work.

use crate::net::Fragment;
use crate::status::{Listener, ListenerId, StateMachine};
use crate::sync_rule::{NetSynchronizationRule, RuleStatus};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Condition raised once the net has started running
pub const STARTED: &str = "started";
/// Condition raised when the net terminates normally
pub const COMPLETED: &str = "completed";
/// Condition raised when the net was cancelled on request
pub const CANCELLED: &str = "cancelled";
/// Condition raised when the net stops with an error
pub const FAILED: &str = "failed";

/// Conditions every net carries besides its own boolean outputs
pub const STANDARD_CONDITIONS: [&str; 4] = [STARTED, COMPLETED, CANCELLED, FAILED];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NetId(pub u64);

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetStatus {
    Ready,
    Scheduled,
    Running,
    Cancelling,
    Terminated,
    Error,
    Unloaded,
}

impl NetStatus {
    fn rank(&self) -> u8 {
        match self {
            NetStatus::Ready => 0,
            NetStatus::Scheduled => 1,
            NetStatus::Running => 2,
            NetStatus::Cancelling => 3,
            NetStatus::Terminated | NetStatus::Error => 4,
            NetStatus::Unloaded => 5,
        }
    }

    /// Whether the net no longer executes
    pub fn is_finished(&self) -> bool {
        self.rank() >= 4
    }
}

impl StateMachine for NetStatus {
    fn is_terminal(&self) -> bool {
        self.is_finished()
    }

    fn can_move_to(&self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

/// Engine view of one net condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionStatus {
    /// The condition has occurred
    Active,
    /// Not occurred yet, still reachable
    Possible,
    /// Can no longer occur
    Impossible,
}

impl StateMachine for ConditionStatus {
    fn is_terminal(&self) -> bool {
        !matches!(self, ConditionStatus::Possible)
    }

    fn can_move_to(&self, _next: Self) -> bool {
        matches!(self, ConditionStatus::Possible)
    }
}

/// A named boolean condition of one loaded net
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NetResult {
    net: NetId,
    name: String,
}

impl NetResult {
    pub fn new(net: NetId, name: &str) -> Self {
        Self {
            net,
            name: name.to_string(),
        }
    }

    pub fn net(&self) -> NetId {
        self.net
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for NetResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.net, self.name)
    }
}

pub type ConditionListener = Arc<dyn Fn(&str, ConditionStatus) + Send + Sync>;

/// Remote reference to one loaded net
///
/// Every operation other than `unload` fails with [`crate::RccError::Unloaded`]
/// once the net has been unloaded.
#[async_trait]
pub trait NetHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> NetId;

    fn description(&self) -> &str;

    fn status(&self) -> NetStatus;

    /// Condition `name` of this net
    fn result(&self, name: &str) -> Result<NetResult>;

    /// Conditions of this net; empty once it is unloaded
    fn results(&self) -> Vec<NetResult>;

    /// `None` for unknown conditions and once the net is unloaded
    fn condition_status(&self, name: &str) -> Option<ConditionStatus>;

    /// Listen to condition changes of this net, called with the condition name.
    /// Listeners added after unload are never called.
    fn add_condition_listener(&self, listener: ConditionListener) -> ListenerId;

    fn remove_condition_listener(&self, id: ListenerId) -> bool;

    fn add_status_listener(&self, listener: Listener<NetStatus>) -> ListenerId;

    fn remove_status_listener(&self, id: ListenerId) -> bool;

    async fn start(&self) -> Result<bool>;

    /// Start this net once `predecessor` completes
    async fn schedule_after(&self, predecessor: &dyn NetHandle) -> Result<bool>;

    /// Start this net once `condition` occurs
    async fn schedule_when(&self, condition: &NetResult) -> Result<bool>;

    /// Stop immediately, without a controlled shutdown
    async fn abort(&self) -> Result<bool>;

    /// Request a controlled stop
    async fn cancel(&self) -> Result<bool>;

    /// Release engine-side resources
    async fn unload(&self) -> Result<()>;

    /// Wait until the net no longer executes
    async fn wait_complete(&self) -> Result<NetStatus>;
}

/// A net-level action performed when a synchronization rule fires
#[derive(Debug, Clone)]
pub enum CommandOperation {
    Start(Arc<dyn NetHandle>),
    Abort(Arc<dyn NetHandle>),
    Cancel(Arc<dyn NetHandle>),
}

pub trait DeviceListener: Send + Sync {
    fn device_added(&self, name: &str);

    fn device_removed(&self, name: &str);
}

/// The single channel to the execution engine
#[async_trait]
pub trait ControlCore: Send + Sync {
    /// Upload `fragment` as a new net
    async fn load(&self, fragment: &Fragment, description: &str, realtime: bool) -> Result<Arc<dyn NetHandle>>;

    /// Run one cycle of `fragment` without keeping a net and return its
    /// output and netcomm values by name
    async fn eval(&self, fragment: &Fragment) -> Result<BTreeMap<String, String>>;

    /// Start `nets` unconditionally
    async fn start(&self, nets: &[Arc<dyn NetHandle>]) -> Result<bool>;

    /// Install a rule that, once every condition in `results` has occurred,
    /// stops `stop`, cancels `cancel` and starts `start` in one engine cycle.
    /// `None` when the engine refuses the rule.
    async fn schedule(
        &self,
        results: &[NetResult],
        stop: &[Arc<dyn NetHandle>],
        cancel: &[Arc<dyn NetHandle>],
        start: &[Arc<dyn NetHandle>],
    ) -> Option<Arc<NetSynchronizationRule>>;

    /// Schedule command-level operations; `on_started` runs once the rule fired
    async fn schedule_operations(
        &self,
        conditions: &[NetResult],
        operations: &[CommandOperation],
        on_started: Box<dyn FnOnce() + Send>,
    ) -> Option<Arc<NetSynchronizationRule>> {
        let mut stop = Vec::new();
        let mut cancel = Vec::new();
        let mut start = Vec::new();
        for operation in operations {
            match operation {
                CommandOperation::Start(net) => start.push(net.clone()),
                CommandOperation::Abort(net) => stop.push(net.clone()),
                CommandOperation::Cancel(net) => cancel.push(net.clone()),
            }
        }
        let rule = self.schedule(conditions, &stop, &cancel, &start).await?;
        debug!(
            "Scheduled {} start, {} stop, {} cancel operations on {} conditions",
            start.len(),
            stop.len(),
            cancel.len(),
            conditions.len()
        );
        let callback = Mutex::new(Some(on_started));
        rule.add_listener(move |status| {
            if status == RuleStatus::Fired {
                if let Some(callback) = callback.lock().take() {
                    callback();
                }
            }
        });
        Some(rule)
    }

    /// Fails with [`crate::RccError::DispatchThread`] on the engine's dispatch thread
    fn check_block_event_handler_thread(&self) -> Result<()>;

    async fn create_device(&self, name: &str) -> Result<()>;

    async fn remove_device(&self, name: &str) -> Result<()>;

    /// Known devices are reported to a new listener as added
    fn add_device_listener(&self, listener: Arc<dyn DeviceListener>) -> ListenerId;

    fn remove_device_listener(&self, id: ListenerId) -> bool;
}
