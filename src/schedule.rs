//! Activity schedules: loading, activating and cancelling the nets of an activity
//!
//! A [`RuntimeSchedule`] owns the commands of one activity, the predecessor
//! outcome it continues from and the possible outcomes it may reach. Its
//! lifecycle is `Unloaded -> Loaded -> Active -> Complete | Cancelled |
//! Failed | Impossible`. Activation installs a single synchronization rule
//! on the control core: once the predecessor outcome holds, the predecessor's
//! nets are aborted and this schedule's nets (and those of its dependencies)
//! are started in the same engine cycle. A schedule can be activated once.
//!
//! On `Failed` or `Impossible`, either its own or that of an attached
//! [`ActivityHandle`], the schedule unloads its nets in the background.

use crate::command::{Command, CommandHandle, CommandResult};
use crate::control_core::{CommandOperation, ControlCore, NetResult};
use crate::result::{ActivityResult, ResultStatus, RuntimeResult};
use crate::status::{Listener, ListenerId, Observable, StateMachine};
use crate::sync_rule::{NetSynchronizationRule, RuleStatus};
use crate::{Result, RccError};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Unloaded,
    Loaded,
    Active,
    Complete,
    Cancelled,
    Failed,
    Impossible,
}

impl ScheduleStatus {
    fn rank(&self) -> u8 {
        match self {
            ScheduleStatus::Unloaded => 0,
            ScheduleStatus::Loaded => 1,
            ScheduleStatus::Active => 2,
            _ => 3,
        }
    }

    fn is_failure(&self) -> bool {
        matches!(self, ScheduleStatus::Failed | ScheduleStatus::Impossible)
    }
}

impl StateMachine for ScheduleStatus {
    fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    fn can_move_to(&self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

#[async_trait]
pub trait ActivitySchedule: Send + Sync {
    fn name(&self) -> &str;

    fn status(&self) -> ScheduleStatus;

    fn devices(&self) -> BTreeSet<String>;

    /// Possible outcomes of this schedule
    fn results(&self) -> Vec<RuntimeResult>;

    /// Whether the schedule has been started; a schedule is started at most once
    fn is_taken(&self) -> bool;

    fn add_status_listener(&self, listener: Listener<ScheduleStatus>) -> ListenerId;

    /// Start operations for every net of this schedule and its dependencies
    fn start_operations(&self) -> Result<Vec<CommandOperation>>;

    /// Called when the nets were started by the rule of another schedule
    fn started(&self);

    /// Load all nets, including those of dependencies
    async fn load(&self) -> Result<()>;

    /// Ask the control core to start this schedule after its predecessor.
    /// `Ok(false)` when the engine refused; the schedule is then `Impossible`.
    async fn activate(&self) -> Result<bool>;

    /// Request a controlled stop of every net; engine failures are logged
    async fn cancel(&self);

    async fn unload(&self) -> Result<()>;
}

/// Application-side handle of a running activity
#[derive(Debug, Clone)]
pub struct ActivityHandle {
    status: Arc<Observable<ScheduleStatus>>,
}

impl Default for ActivityHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityHandle {
    pub fn new() -> Self {
        Self {
            status: Arc::new(Observable::new(ScheduleStatus::Unloaded)),
        }
    }

    pub fn status(&self) -> ScheduleStatus {
        self.status.get()
    }

    /// Mark the activity failed; the attached schedule unloads its nets
    pub fn fail(&self) -> bool {
        self.status.set(ScheduleStatus::Failed)
    }

    pub fn add_listener(&self, listener: impl Fn(ScheduleStatus) + Send + Sync + 'static) -> ListenerId {
        self.status.add_listener(listener)
    }

    pub async fn wait_terminal(&self) -> ScheduleStatus {
        self.status.wait_terminal().await
    }
}

struct ScheduleInner {
    name: String,
    core: Arc<dyn ControlCore>,
    commands: Vec<Arc<dyn Command>>,
    predecessor: Option<RuntimeResult>,
    results: Vec<RuntimeResult>,
    dependencies: Vec<Arc<dyn ActivitySchedule>>,
    devices: BTreeSet<String>,
    parts: Vec<RuntimeSchedule>,
    status: Observable<ScheduleStatus>,
    activating: AtomicBool,
    taken: AtomicBool,
    unloaded: AtomicBool,
    runtime: Mutex<Option<Handle>>,
    handle: Mutex<Option<ActivityHandle>>,
    rule: Mutex<Option<Arc<NetSynchronizationRule>>>,
}

impl ScheduleInner {
    fn capture_runtime(&self) {
        if let Ok(handle) = Handle::try_current() {
            *self.runtime.lock() = Some(handle);
        }
    }

    /// Derive a terminal status from the outcomes once running
    fn on_result_changed(&self) {
        if self.status.get() != ScheduleStatus::Active {
            return;
        }
        for result in &self.results {
            if result.status() == ResultStatus::Active && result.is_completed() {
                let next = if result.failure().is_some() {
                    ScheduleStatus::Failed
                } else if result.is_cancellation() {
                    ScheduleStatus::Cancelled
                } else {
                    ScheduleStatus::Complete
                };
                self.status.set(next);
                return;
            }
        }
        if !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| r.status() == ResultStatus::Impossible)
        {
            self.status.set(ScheduleStatus::Impossible);
        }
    }

    fn on_status(self: &Arc<Self>, status: ScheduleStatus) {
        info!("Activity '{}' is now {:?}", self.name, status);
        let handle = self.handle.lock().clone();
        if let Some(handle) = handle {
            handle.status.set(status);
        }
        for part in &self.parts {
            if status == ScheduleStatus::Active {
                part.inner.taken.store(true, Ordering::SeqCst);
            }
            part.inner.status.set(status);
        }
        if status.is_failure() {
            self.spawn_unload();
        }
    }

    fn spawn_unload(self: &Arc<Self>) {
        if self.unloaded.load(Ordering::SeqCst) {
            return;
        }
        let runtime = self.runtime.lock().clone();
        let Some(runtime) = runtime else {
            warn!("Activity '{}' has no runtime to unload its nets on", self.name);
            return;
        };
        let schedule = RuntimeSchedule { inner: self.clone() };
        runtime.spawn(async move {
            if let Err(e) = schedule.unload().await {
                error!("Automatic unload of activity '{}' failed: {}", schedule.name(), e);
            }
        });
    }

    fn handles(&self) -> Result<Vec<CommandHandle>> {
        self.commands
            .iter()
            .map(|command| {
                command.handle().ok_or_else(|| {
                    RccError::Schedule(format!(
                        "Command '{}' of activity '{}' is not loaded",
                        command.name(),
                        self.name
                    ))
                })
            })
            .collect()
    }

    /// Every completion of every command must lead to a declared outcome
    fn prepare(&self) -> Result<()> {
        for command in &self.commands {
            for completion in CommandResult::completions(command) {
                if !self.results.iter().any(|r| r.conditions().contains(&completion)) {
                    return Err(RccError::Schedule(format!(
                        "Completion '{}' of command '{}' is not mapped to any outcome of activity '{}'",
                        completion.condition(),
                        command.name(),
                        self.name
                    )));
                }
            }
        }
        for command in &self.commands {
            command.seal()?;
        }
        Ok(())
    }
}

pub struct ScheduleBuilder {
    name: String,
    core: Arc<dyn ControlCore>,
    commands: Vec<Arc<dyn Command>>,
    predecessor: Option<RuntimeResult>,
    results: Vec<RuntimeResult>,
    dependencies: Vec<Arc<dyn ActivitySchedule>>,
    devices: BTreeSet<String>,
}

impl ScheduleBuilder {
    pub fn command(mut self, command: Arc<dyn Command>) -> Self {
        self.commands.push(command);
        self
    }

    /// Outcome this schedule continues from
    pub fn predecessor(mut self, result: RuntimeResult) -> Self {
        self.predecessor = Some(result);
        self
    }

    /// A possible outcome of this schedule
    pub fn result(mut self, result: RuntimeResult) -> Self {
        self.results.push(result);
        self
    }

    /// A schedule loaded and started together with this one
    pub fn dependency(mut self, schedule: Arc<dyn ActivitySchedule>) -> Self {
        self.dependencies.push(schedule);
        self
    }

    pub fn device(mut self, name: &str) -> Self {
        self.devices.insert(name.to_string());
        self
    }

    pub fn build(self) -> RuntimeSchedule {
        let mut devices = self.devices;
        for result in &self.results {
            devices.extend(result.devices().iter().cloned());
        }
        RuntimeSchedule::assemble(
            self.name,
            self.core,
            self.commands,
            self.predecessor,
            self.results,
            self.dependencies,
            devices,
            Vec::new(),
        )
    }
}

#[derive(Clone)]
pub struct RuntimeSchedule {
    inner: Arc<ScheduleInner>,
}

impl RuntimeSchedule {
    pub fn builder(name: &str, core: Arc<dyn ControlCore>) -> ScheduleBuilder {
        ScheduleBuilder {
            name: name.to_string(),
            core,
            commands: Vec::new(),
            predecessor: None,
            results: Vec::new(),
            dependencies: Vec::new(),
            devices: BTreeSet::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        name: String,
        core: Arc<dyn ControlCore>,
        commands: Vec<Arc<dyn Command>>,
        predecessor: Option<RuntimeResult>,
        results: Vec<RuntimeResult>,
        dependencies: Vec<Arc<dyn ActivitySchedule>>,
        devices: BTreeSet<String>,
        parts: Vec<RuntimeSchedule>,
    ) -> Self {
        let inner = Arc::new(ScheduleInner {
            name,
            core,
            commands,
            predecessor,
            results,
            dependencies,
            devices,
            parts,
            status: Observable::new(ScheduleStatus::Unloaded),
            activating: AtomicBool::new(false),
            taken: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
            runtime: Mutex::new(Handle::try_current().ok()),
            handle: Mutex::new(None),
            rule: Mutex::new(None),
        });
        for result in &inner.results {
            let weak = Arc::downgrade(&inner);
            result.add_listener(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_result_changed();
                }
            });
        }
        let weak: Weak<ScheduleInner> = Arc::downgrade(&inner);
        inner.status.add_listener(move |status| {
            if let Some(inner) = weak.upgrade() {
                inner.on_status(status);
            }
        });
        Self { inner }
    }

    pub fn predecessor(&self) -> Option<&RuntimeResult> {
        self.inner.predecessor.as_ref()
    }

    pub fn commands(&self) -> &[Arc<dyn Command>] {
        &self.inner.commands
    }

    /// Synchronization rule installed by `activate`
    pub fn rule(&self) -> Option<Arc<NetSynchronizationRule>> {
        self.inner.rule.lock().clone()
    }

    pub fn is_unloaded(&self) -> bool {
        self.inner.unloaded.load(Ordering::SeqCst)
    }

    pub async fn wait_terminal(&self) -> ScheduleStatus {
        self.inner.status.wait_terminal().await
    }

    /// Mirror this schedule's status into `handle` and unload when it fails
    pub fn attach_handle(&self, handle: &ActivityHandle) {
        *self.inner.handle.lock() = Some(handle.clone());
        handle.status.set(self.status());
        let weak = Arc::downgrade(&self.inner);
        handle.add_listener(move |status| {
            if status.is_failure() {
                if let Some(inner) = weak.upgrade() {
                    inner.spawn_unload();
                }
            }
        });
    }

    /// Run `self` and `other` as one unit; their devices must not overlap
    pub fn with_parallel(&self, other: &RuntimeSchedule) -> Result<RuntimeSchedule> {
        let (a, b) = (&self.inner, &other.inner);
        if let Some(device) = a.devices.intersection(&b.devices).next() {
            return Err(RccError::Schedule(format!(
                "Activities '{}' and '{}' both use device '{}'",
                a.name, b.name, device
            )));
        }
        if a.status.get() != ScheduleStatus::Unloaded || b.status.get() != ScheduleStatus::Unloaded {
            return Err(RccError::Schedule(
                "Only unloaded activities can run in parallel".to_string(),
            ));
        }

        let predecessor = match (&a.predecessor, &b.predecessor) {
            (Some(x), Some(y)) => Some(x.and(y)),
            (Some(x), None) | (None, Some(x)) => Some(x.clone()),
            (None, None) => None,
        };
        let results = if a.results.is_empty() {
            b.results.clone()
        } else if b.results.is_empty() {
            a.results.clone()
        } else {
            a.results
                .iter()
                .flat_map(|x| b.results.iter().map(move |y| x.and(y)))
                .collect()
        };

        Ok(RuntimeSchedule::assemble(
            format!("{}+{}", a.name, b.name),
            a.core.clone(),
            a.commands.iter().chain(&b.commands).cloned().collect(),
            predecessor,
            results,
            a.dependencies.iter().chain(&b.dependencies).cloned().collect(),
            a.devices.union(&b.devices).cloned().collect(),
            vec![self.clone(), other.clone()],
        ))
    }

    /// Start conditions and operations of the rule that activates this schedule
    fn activation_plan(&self) -> Result<(Vec<NetResult>, Vec<CommandOperation>)> {
        let conditions = match &self.inner.predecessor {
            Some(predecessor) => {
                predecessor.register_status_listener()?;
                predecessor
                    .conditions()
                    .iter()
                    .map(CommandResult::net_result)
                    .collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };
        let mut operations = self.predecessor_operations()?;
        operations.extend(self.start_operations()?);
        Ok((conditions, operations))
    }

    /// Nets of the predecessor outcome, to be aborted when this schedule starts
    fn predecessor_operations(&self) -> Result<Vec<CommandOperation>> {
        let Some(predecessor) = &self.inner.predecessor else {
            return Ok(Vec::new());
        };
        let mut nets = BTreeMap::new();
        for condition in predecessor.conditions() {
            let handle = condition.handle()?;
            if !handle.status().is_finished() {
                nets.entry(handle.id()).or_insert(handle);
            }
        }
        Ok(nets.values().map(CommandHandle::abort_operation).collect())
    }
}

#[async_trait]
impl ActivitySchedule for RuntimeSchedule {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn status(&self) -> ScheduleStatus {
        self.inner.status.get()
    }

    fn devices(&self) -> BTreeSet<String> {
        self.inner.devices.clone()
    }

    fn results(&self) -> Vec<RuntimeResult> {
        self.inner.results.clone()
    }

    fn is_taken(&self) -> bool {
        self.inner.taken.load(Ordering::SeqCst)
    }

    fn add_status_listener(&self, listener: Listener<ScheduleStatus>) -> ListenerId {
        self.inner.status.add_shared_listener(listener, false)
    }

    fn start_operations(&self) -> Result<Vec<CommandOperation>> {
        let mut operations: Vec<CommandOperation> = self
            .inner
            .handles()?
            .iter()
            .map(CommandHandle::start_operation)
            .collect();
        for dependency in &self.inner.dependencies {
            operations.extend(dependency.start_operations()?);
        }
        Ok(operations)
    }

    fn started(&self) {
        self.inner.taken.store(true, Ordering::SeqCst);
        for dependency in &self.inner.dependencies {
            dependency.started();
        }
        self.inner.status.set(ScheduleStatus::Active);
        self.inner.on_result_changed();
    }

    async fn load(&self) -> Result<()> {
        let inner = &self.inner;
        match inner.status.get() {
            ScheduleStatus::Loaded => return Ok(()),
            ScheduleStatus::Unloaded if !inner.unloaded.load(Ordering::SeqCst) => {}
            status => {
                return Err(RccError::Schedule(format!(
                    "Cannot load activity '{}' in status {:?}",
                    inner.name, status
                )))
            }
        }
        inner.capture_runtime();
        inner.prepare()?;

        let loaded = join_all(inner.commands.iter().map(|command| command.load())).await;
        let dependencies = join_all(inner.dependencies.iter().map(|d| d.load())).await;
        let loaded_dependencies: Vec<_> = inner
            .dependencies
            .iter()
            .zip(&dependencies)
            .filter(|(_, r)| r.is_ok())
            .map(|(dependency, _)| dependency.clone())
            .collect();
        let failure = loaded
            .into_iter()
            .filter_map(|r| r.err())
            .chain(dependencies.into_iter().filter_map(|r| r.err()))
            .next()
            .or_else(|| {
                inner
                    .results
                    .iter()
                    .find_map(|result| result.register_status_listener().err())
            });
        if let Some(e) = failure {
            error!("Loading activity '{}' failed: {}", inner.name, e);
            for command in &inner.commands {
                if let Err(unload_error) = command.unload().await {
                    warn!("Unloading command '{}' failed: {}", command.name(), unload_error);
                }
            }
            for dependency in loaded_dependencies {
                if let Err(unload_error) = dependency.unload().await {
                    warn!("Unloading dependency '{}' failed: {}", dependency.name(), unload_error);
                }
            }
            return Err(e);
        }

        inner.status.set(ScheduleStatus::Loaded);
        Ok(())
    }

    async fn activate(&self) -> Result<bool> {
        let inner = &self.inner;
        inner.core.check_block_event_handler_thread()?;
        if inner.activating.swap(true, Ordering::SeqCst) {
            return Err(RccError::Schedule(format!(
                "Activity '{}' was already activated",
                inner.name
            )));
        }
        let status = inner.status.get();
        if status != ScheduleStatus::Loaded {
            inner.activating.store(false, Ordering::SeqCst);
            return Err(RccError::Schedule(format!(
                "Cannot activate activity '{}' in status {:?}",
                inner.name, status
            )));
        }
        inner.capture_runtime();

        let (conditions, operations) = match self.activation_plan() {
            Ok(plan) => plan,
            Err(e) => {
                inner.activating.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let weak = Arc::downgrade(inner);
        let on_started = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                RuntimeSchedule { inner }.started();
            }
        });
        let Some(rule) = inner
            .core
            .schedule_operations(&conditions, &operations, on_started)
            .await
        else {
            warn!("Control core refused to schedule activity '{}'", inner.name);
            inner.status.set(ScheduleStatus::Impossible);
            return Ok(false);
        };

        let weak = Arc::downgrade(inner);
        rule.add_listener(move |status| {
            if matches!(status, RuleStatus::FireFailed | RuleStatus::Inactive | RuleStatus::Invalid) {
                if let Some(inner) = weak.upgrade() {
                    warn!("Start rule of activity '{}' ended as {:?}", inner.name, status);
                    inner.status.set(ScheduleStatus::Impossible);
                }
            }
        });
        info!(
            "Activity '{}' scheduled on {} conditions with rule {}",
            inner.name,
            conditions.len(),
            rule.id()
        );
        *inner.rule.lock() = Some(rule);
        Ok(true)
    }

    async fn cancel(&self) {
        let inner = &self.inner;
        for command in &inner.commands {
            let Some(handle) = command.handle() else {
                continue;
            };
            match handle.net().cancel().await {
                Ok(true) => info!("Cancel requested for command '{}'", command.name()),
                Ok(false) => warn!("Control core did not accept cancel of command '{}'", command.name()),
                Err(e) => error!("Failed to cancel command '{}': {}", command.name(), e),
            }
        }
        for dependency in &inner.dependencies {
            dependency.cancel().await;
        }
        if inner.status.get() == ScheduleStatus::Loaded {
            inner.status.set(ScheduleStatus::Cancelled);
        }
    }

    async fn unload(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.unloaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error = None;
        for command in &inner.commands {
            if let Err(e) = command.unload().await {
                error!("Failed to unload command '{}': {}", command.name(), e);
                first_error.get_or_insert(e);
            }
        }
        for dependency in &inner.dependencies {
            if let Err(e) = dependency.unload().await {
                error!("Failed to unload dependency '{}': {}", dependency.name(), e);
                first_error.get_or_insert(e);
            }
        }
        if !inner.status.get().is_terminal() {
            inner.status.set(ScheduleStatus::Cancelled);
        }
        info!("Activity '{}' unloaded", inner.name);
        first_error.map_or(Ok(()), Err)
    }
}
