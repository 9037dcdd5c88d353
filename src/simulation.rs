//! In-process control core for tests and dry runs
//!
//! [`SimulatedCore`] keeps nets, rules and devices in memory. Every state
//! change happens on one dispatch thread fed through a bounded queue, so
//! listeners observe the same threading as with a real engine. Nets do not
//! compute anything while running; the caller drives them with
//! [`SimulatedCore::raise`], [`SimulatedCore::finish`] and
//! [`SimulatedCore::fail`]. [`ControlCore::eval`] resolves constant values
//! wired straight into fragment outputs and netcomm outputs.

use crate::config::CoreConfig;
use crate::control_core::{
    ConditionListener, ConditionStatus, ControlCore, DeviceListener, NetHandle, NetId, NetResult, NetStatus,
    CANCELLED, COMPLETED, FAILED, STANDARD_CONDITIONS, STARTED,
};
use crate::net::{Fragment, OutPortRef, PrimitiveKind};
use crate::parser::NetParser;
use crate::serializer::serialize;
use crate::status::{Listener, ListenerId, Observable};
use crate::sync_rule::{NetSynchronizationRule, RuleStatus};
use crate::{Result, RccError};
use async_trait::async_trait;
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send>;

/// How a net stops
#[derive(Debug, Clone)]
enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
    Aborted,
}

enum Readiness {
    Waiting,
    Ready,
    Unreachable,
}

struct SimulatedNet {
    id: NetId,
    description: String,
    realtime: bool,
    text: String,
    status: Observable<NetStatus>,
    conditions: Mutex<BTreeMap<String, ConditionStatus>>,
    condition_listeners: Mutex<Vec<(ListenerId, ConditionListener)>>,
    next_listener: AtomicU64,
    engine: Weak<Engine>,
}

impl fmt::Debug for SimulatedNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedNet")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("realtime", &self.realtime)
            .field("status", &self.status.get())
            .finish()
    }
}

impl SimulatedNet {
    fn set_condition(&self, name: &str, status: ConditionStatus) -> bool {
        {
            let mut conditions = self.conditions.lock();
            match conditions.get_mut(name) {
                Some(current) if *current == ConditionStatus::Possible => *current = status,
                _ => return false,
            }
        }
        debug!("{}.{} is now {:?}", self.id, name, status);
        let listeners: Vec<ConditionListener> = self
            .condition_listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(name, status);
        }
        true
    }

    /// Conditions that did not occur can no longer occur
    fn resolve_pending(&self) {
        let pending: Vec<String> = self
            .conditions
            .lock()
            .iter()
            .filter(|(_, status)| **status == ConditionStatus::Possible)
            .map(|(name, _)| name.clone())
            .collect();
        for name in pending {
            self.set_condition(&name, ConditionStatus::Impossible);
        }
    }

    fn is_unloaded(&self) -> bool {
        self.status.get() == NetStatus::Unloaded
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.is_unloaded() {
            return Err(RccError::Unloaded(self.id.to_string()));
        }
        Ok(())
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| RccError::Engine("Control core has shut down".to_string()))
    }

    async fn on_engine<T, F>(&self, action: F) -> Result<T>
    where
        F: FnOnce(&Engine, &SimulatedNet) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_loaded()?;
        let id = self.id;
        self.engine()?
            .run(move |engine| {
                let net = engine.net(id).ok_or_else(|| RccError::Unloaded(id.to_string()))?;
                let value = action(engine, net.as_ref());
                engine.evaluate_rules();
                Ok(value)
            })
            .await?
    }
}

#[async_trait]
impl NetHandle for SimulatedNet {
    fn id(&self) -> NetId {
        self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn status(&self) -> NetStatus {
        self.status.get()
    }

    fn result(&self, name: &str) -> Result<NetResult> {
        self.ensure_loaded()?;
        if !self.conditions.lock().contains_key(name) {
            return Err(RccError::Engine(format!("{} has no condition '{}'", self.id, name)));
        }
        Ok(NetResult::new(self.id, name))
    }

    fn results(&self) -> Vec<NetResult> {
        if self.is_unloaded() {
            return Vec::new();
        }
        self.conditions
            .lock()
            .keys()
            .map(|name| NetResult::new(self.id, name))
            .collect()
    }

    fn condition_status(&self, name: &str) -> Option<ConditionStatus> {
        if self.is_unloaded() {
            return None;
        }
        self.conditions.lock().get(name).copied()
    }

    fn add_condition_listener(&self, listener: ConditionListener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        // an unloaded net never changes again
        if !self.is_unloaded() {
            self.condition_listeners.lock().push((id, listener));
        }
        id
    }

    fn remove_condition_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.condition_listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn add_status_listener(&self, listener: Listener<NetStatus>) -> ListenerId {
        self.status.add_shared_listener(listener, false)
    }

    fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.status.remove_listener(id)
    }

    async fn start(&self) -> Result<bool> {
        self.on_engine(|engine, net| engine.start_net(net)).await
    }

    async fn schedule_after(&self, predecessor: &dyn NetHandle) -> Result<bool> {
        let completed = predecessor.result(COMPLETED)?;
        self.schedule_when(&completed).await
    }

    async fn schedule_when(&self, condition: &NetResult) -> Result<bool> {
        self.ensure_loaded()?;
        let rule = self
            .engine()?
            .install_rule(vec![condition.clone()], Vec::new(), Vec::new(), vec![self.id])
            .await?;
        Ok(rule.is_some())
    }

    async fn abort(&self) -> Result<bool> {
        self.on_engine(|engine, net| engine.stop_net(net, Outcome::Aborted)).await
    }

    async fn cancel(&self) -> Result<bool> {
        self.on_engine(|engine, net| engine.cancel_net(net)).await
    }

    async fn unload(&self) -> Result<()> {
        if self.status.get() == NetStatus::Unloaded {
            return Ok(());
        }
        let id = self.id;
        self.engine()?.run(move |engine| engine.unload_net(id)).await
    }

    async fn wait_complete(&self) -> Result<NetStatus> {
        if self.engine()?.on_dispatch_thread() {
            return Err(RccError::DispatchThread);
        }
        Ok(self.status.wait_terminal().await)
    }
}

struct Engine {
    sender: Sender<Job>,
    dispatch_thread: ThreadId,
    parser: NetParser,
    rejected_types: Vec<String>,
    next_net: AtomicU64,
    nets: Mutex<BTreeMap<NetId, Arc<SimulatedNet>>>,
    rules: Mutex<Vec<Arc<NetSynchronizationRule>>>,
    devices: Mutex<BTreeSet<String>>,
    device_listeners: Mutex<Vec<(ListenerId, Arc<dyn DeviceListener>)>>,
    next_listener: AtomicU64,
    refuse_schedules: AtomicBool,
}

impl Engine {
    fn on_dispatch_thread(&self) -> bool {
        thread::current().id() == self.dispatch_thread
    }

    /// Queue `job` without waiting for it
    fn post(&self, job: Job) -> Result<()> {
        self.sender
            .try_send(job)
            .map_err(|e| RccError::Engine(format!("Dispatch queue rejected work: {}", e)))
    }

    /// Run `action` on the dispatch thread and wait for its value
    async fn run<T, F>(self: &Arc<Self>, action: F) -> Result<T>
    where
        F: FnOnce(&Engine) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let engine = self.clone();
        self.post(Box::new(move || {
            let _ = tx.send(action(&engine));
        }))?;
        rx.await
            .map_err(|_| RccError::Engine("Dispatch thread stopped".to_string()))
    }

    fn net(&self, id: NetId) -> Option<Arc<SimulatedNet>> {
        self.nets.lock().get(&id).cloned()
    }

    fn start_net(&self, net: &SimulatedNet) -> bool {
        match net.status.get() {
            NetStatus::Ready | NetStatus::Scheduled => {
                net.status.set(NetStatus::Running);
                net.set_condition(STARTED, ConditionStatus::Active);
                info!("Started {} ({})", net.id, net.description);
                true
            }
            status => {
                warn!("Cannot start {} in status {:?}", net.id, status);
                false
            }
        }
    }

    fn stop_net(&self, net: &SimulatedNet, outcome: Outcome) -> bool {
        if net.status.get().is_finished() {
            return false;
        }
        match &outcome {
            Outcome::Completed => {
                net.status.set(NetStatus::Terminated);
                net.set_condition(COMPLETED, ConditionStatus::Active);
            }
            Outcome::Cancelled => {
                net.status.set(NetStatus::Cancelling);
                net.status.set(NetStatus::Terminated);
                net.set_condition(CANCELLED, ConditionStatus::Active);
            }
            Outcome::Failed(reason) => {
                warn!("{} failed: {}", net.id, reason);
                net.status.set(NetStatus::Error);
                net.set_condition(FAILED, ConditionStatus::Active);
            }
            Outcome::Aborted => {
                net.status.set(NetStatus::Terminated);
            }
        }
        net.resolve_pending();
        info!("{} stopped: {:?}", net.id, outcome);
        true
    }

    fn cancel_net(&self, net: &SimulatedNet) -> bool {
        self.stop_net(net, Outcome::Cancelled)
    }

    fn unload_net(&self, id: NetId) {
        let Some(net) = self.nets.lock().remove(&id) else {
            return;
        };
        self.stop_net(&net, Outcome::Aborted);
        net.status.set(NetStatus::Unloaded);
        net.condition_listeners.lock().clear();
        let affected: Vec<Arc<NetSynchronizationRule>> = self
            .rules
            .lock()
            .iter()
            .filter(|rule| rule.touches(id))
            .cloned()
            .collect();
        for rule in affected {
            rule.supersede();
        }
        self.evaluate_rules();
        info!("Unloaded {}", id);
    }

    fn readiness(&self, rule: &NetSynchronizationRule) -> Readiness {
        let mut waiting = false;
        for condition in rule.conditions() {
            let status = self
                .net(condition.net())
                .and_then(|net| net.condition_status(condition.name()));
            match status {
                Some(ConditionStatus::Active) => {}
                Some(ConditionStatus::Possible) => waiting = true,
                Some(ConditionStatus::Impossible) | None => return Readiness::Unreachable,
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    /// Perform the actions of a rule whose conditions hold
    fn fire(&self, rule: &NetSynchronizationRule) -> bool {
        let mut starts = Vec::new();
        for id in rule.start_nets() {
            match self.net(*id) {
                Some(net) if matches!(net.status.get(), NetStatus::Ready | NetStatus::Scheduled) => starts.push(net),
                _ => {
                    warn!("Rule {} cannot start {}", rule.id(), id);
                    return false;
                }
            }
        }
        for net in rule.stop_nets().iter().filter_map(|id| self.net(*id)) {
            self.stop_net(&net, Outcome::Aborted);
        }
        for net in rule.cancel_nets().iter().filter_map(|id| self.net(*id)) {
            self.cancel_net(&net);
        }
        starts.iter().all(|net| self.start_net(net))
    }

    /// Fire or retire pending rules until nothing changes
    fn evaluate_rules(&self) {
        loop {
            let pending: Vec<Arc<NetSynchronizationRule>> = self
                .rules
                .lock()
                .iter()
                .filter(|rule| rule.status() == RuleStatus::Active)
                .cloned()
                .collect();
            let mut fired = false;
            for rule in pending {
                if rule.status() != RuleStatus::Active {
                    continue;
                }
                match self.readiness(&rule) {
                    Readiness::Waiting => {}
                    Readiness::Unreachable => {
                        debug!("Rule {} can no longer fire", rule.id());
                        rule.supersede();
                    }
                    Readiness::Ready => {
                        let succeeded = self.fire(&rule);
                        rule.fire(succeeded);
                        fired = true;
                    }
                }
            }
            self.rules.lock().retain(|rule| rule.status() == RuleStatus::Active);
            if !fired {
                break;
            }
        }
    }

    async fn install_rule(
        self: &Arc<Self>,
        conditions: Vec<NetResult>,
        stop: Vec<NetId>,
        cancel: Vec<NetId>,
        start: Vec<NetId>,
    ) -> Result<Option<Arc<NetSynchronizationRule>>> {
        if self.refuse_schedules.load(Ordering::SeqCst) {
            warn!("Refusing rule on {} conditions", conditions.len());
            return Ok(None);
        }
        self.run(move |engine| {
            let referenced = conditions
                .iter()
                .map(NetResult::net)
                .chain(stop.iter().copied())
                .chain(cancel.iter().copied())
                .chain(start.iter().copied());
            for id in referenced {
                if engine.net(id).is_none() {
                    warn!("Rule refers to unknown net {}", id);
                    return None;
                }
            }
            let superseded: Vec<Arc<NetSynchronizationRule>> = engine
                .rules
                .lock()
                .iter()
                .filter(|rule| rule.start_nets().iter().any(|id| start.contains(id)))
                .cloned()
                .collect();
            for rule in superseded {
                rule.supersede();
            }
            for net in start.iter().filter_map(|id| engine.net(*id)) {
                if net.status.get() == NetStatus::Ready {
                    net.status.set(NetStatus::Scheduled);
                }
            }
            let rule = Arc::new(NetSynchronizationRule::new(conditions, stop, cancel, start));
            debug!("Installed rule {}", rule.id());
            engine.rules.lock().push(rule.clone());
            engine.evaluate_rules();
            Some(rule)
        })
        .await
    }

    fn notify_devices(&self, name: &str, added: bool) {
        let listeners: Vec<Arc<dyn DeviceListener>> = self
            .device_listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            if added {
                listener.device_added(name);
            } else {
                listener.device_removed(name);
            }
        }
    }
}

/// A control core simulated in process
pub struct SimulatedCore {
    engine: Arc<Engine>,
}

impl SimulatedCore {
    pub fn new(config: &CoreConfig) -> Result<Self> {
        let (sender, receiver) = bounded::<Job>(config.dispatch_queue());
        let dispatch = thread::Builder::new()
            .name("rcc-dispatch".to_string())
            .spawn(move || {
                for job in receiver.iter() {
                    job();
                }
            })?;
        let engine = Engine {
            sender,
            dispatch_thread: dispatch.thread().id(),
            parser: NetParser::from_config(config),
            rejected_types: config.rejected_types(),
            next_net: AtomicU64::new(1),
            nets: Mutex::new(BTreeMap::new()),
            rules: Mutex::new(Vec::new()),
            devices: Mutex::new(BTreeSet::new()),
            device_listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            refuse_schedules: AtomicBool::new(false),
        };
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    /// Make `schedule` fail as if the engine rejected every rule
    pub fn refuse_schedules(&self, refuse: bool) {
        self.engine.refuse_schedules.store(refuse, Ordering::SeqCst);
    }

    pub fn net(&self, id: NetId) -> Option<Arc<dyn NetHandle>> {
        self.engine.net(id).map(|net| net as Arc<dyn NetHandle>)
    }

    pub fn loaded_nets(&self) -> Vec<NetId> {
        self.engine.nets.lock().keys().copied().collect()
    }

    /// Wire text the net was loaded from
    pub fn net_text(&self, id: NetId) -> Option<String> {
        self.engine.net(id).map(|net| net.text.clone())
    }

    pub fn devices(&self) -> Vec<String> {
        self.engine.devices.lock().iter().cloned().collect()
    }

    /// Number of rules still waiting for their conditions
    pub fn pending_rules(&self) -> usize {
        self.engine.rules.lock().len()
    }

    /// Let condition `condition` of a running net occur
    pub async fn raise(&self, net: NetId, condition: &str) -> Result<()> {
        let condition = condition.to_string();
        self.engine
            .run(move |engine| {
                let target = engine
                    .net(net)
                    .ok_or_else(|| RccError::Engine(format!("Unknown net {}", net)))?;
                if target.condition_status(&condition).is_none() {
                    return Err(RccError::Engine(format!("{} has no condition '{}'", net, condition)));
                }
                target.set_condition(&condition, ConditionStatus::Active);
                engine.evaluate_rules();
                Ok(())
            })
            .await?
    }

    /// Terminate a net normally
    pub async fn finish(&self, net: NetId) -> Result<()> {
        self.stop(net, Outcome::Completed).await
    }

    /// Terminate a net with an error
    pub async fn fail(&self, net: NetId, reason: &str) -> Result<()> {
        self.stop(net, Outcome::Failed(reason.to_string())).await
    }

    async fn stop(&self, net: NetId, outcome: Outcome) -> Result<()> {
        self.engine
            .run(move |engine| {
                let target = engine
                    .net(net)
                    .ok_or_else(|| RccError::Engine(format!("Unknown net {}", net)))?;
                engine.stop_net(&target, outcome);
                engine.evaluate_rules();
                Ok(())
            })
            .await?
    }

    /// Wait until everything queued so far has been dispatched
    pub async fn flush(&self) -> Result<()> {
        self.engine.run(|_| ()).await
    }
}

#[async_trait]
impl ControlCore for SimulatedCore {
    async fn load(&self, fragment: &Fragment, description: &str, realtime: bool) -> Result<Arc<dyn NetHandle>> {
        let text = serialize(fragment);
        let compiled = self
            .engine
            .parser
            .parse(&text)
            .map_err(|e| RccError::Engine(format!("Net '{}' rejected: {}", description, e)))?;
        let problems = compiled.validate();
        if !problems.is_empty() {
            return Err(RccError::Engine(format!(
                "Net '{}' rejected: {}",
                description,
                problems.join("; ")
            )));
        }
        if let Some(rejected) = compiled
            .type_names()
            .into_iter()
            .find(|name| self.engine.rejected_types.contains(name))
        {
            return Err(RccError::Engine(format!(
                "Net '{}' rejected: unknown primitive type '{}'",
                description, rejected
            )));
        }

        let conditions = STANDARD_CONDITIONS
            .iter()
            .copied()
            .chain(compiled.output_names())
            .map(|name| (name.to_string(), ConditionStatus::Possible))
            .collect();
        let id = NetId(self.engine.next_net.fetch_add(1, Ordering::Relaxed));
        let net = Arc::new(SimulatedNet {
            id,
            description: description.to_string(),
            realtime,
            text,
            status: Observable::new(NetStatus::Ready),
            conditions: Mutex::new(conditions),
            condition_listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            engine: Arc::downgrade(&self.engine),
        });
        self.engine.nets.lock().insert(id, net.clone());
        info!("Loaded {} ({}, realtime: {})", id, description, realtime);
        Ok(net)
    }

    async fn eval(&self, fragment: &Fragment) -> Result<BTreeMap<String, String>> {
        if let Some(rejected) = fragment
            .type_names()
            .into_iter()
            .find(|name| self.engine.rejected_types.contains(name))
        {
            return Err(RccError::Engine(format!("Unknown primitive type '{}'", rejected)));
        }
        let mut constants: HashMap<(String, String), String> = HashMap::new();
        for (_, node) in fragment.children() {
            let Some(primitive) = node.as_primitive() else {
                continue;
            };
            if *primitive.kind() == PrimitiveKind::Leaf && primitive.type_name().ends_with("Value") {
                if let Some(value) = primitive.param("Value") {
                    constants.insert((node.name().to_string(), "outValue".to_string()), value.to_string());
                }
            }
        }
        let lookup = |source: OutPortRef| {
            fragment
                .describe_source(source)
                .and_then(|(owner, port)| constants.get(&(owner.to_string(), port.to_string())))
                .cloned()
        };

        let mut values = BTreeMap::new();
        for output in fragment.outputs() {
            if let Some(value) = lookup(output.source()) {
                values.insert(output.name().to_string(), value);
            }
        }
        for (_, node) in fragment.children() {
            let Some(primitive) = node.as_primitive() else {
                continue;
            };
            let source = primitive.in_port("inValue").and_then(|port| port.source());
            if let (Some(key), Some(source)) = (primitive.netcomm_key(), source) {
                if let Some(value) = lookup(source) {
                    values.insert(key.to_string(), value);
                }
            }
        }
        Ok(values)
    }

    async fn start(&self, nets: &[Arc<dyn NetHandle>]) -> Result<bool> {
        let ids: Vec<NetId> = nets.iter().map(|net| net.id()).collect();
        self.engine
            .run(move |engine| {
                let started = ids.iter().fold(true, |all, id| {
                    let started = engine.net(*id).map_or(false, |net| engine.start_net(&net));
                    all && started
                });
                engine.evaluate_rules();
                started
            })
            .await
    }

    async fn schedule(
        &self,
        results: &[NetResult],
        stop: &[Arc<dyn NetHandle>],
        cancel: &[Arc<dyn NetHandle>],
        start: &[Arc<dyn NetHandle>],
    ) -> Option<Arc<NetSynchronizationRule>> {
        let ids = |nets: &[Arc<dyn NetHandle>]| nets.iter().map(|net| net.id()).collect::<Vec<_>>();
        match self
            .engine
            .install_rule(results.to_vec(), ids(stop), ids(cancel), ids(start))
            .await
        {
            Ok(rule) => rule,
            Err(e) => {
                warn!("Scheduling failed: {}", e);
                None
            }
        }
    }

    fn check_block_event_handler_thread(&self) -> Result<()> {
        if self.engine.on_dispatch_thread() {
            return Err(RccError::DispatchThread);
        }
        Ok(())
    }

    async fn create_device(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.engine
            .run(move |engine| {
                if !engine.devices.lock().insert(name.clone()) {
                    return Err(RccError::Engine(format!("Device '{}' already exists", name)));
                }
                info!("Device '{}' created", name);
                engine.notify_devices(&name, true);
                Ok(())
            })
            .await?
    }

    async fn remove_device(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.engine
            .run(move |engine| {
                if !engine.devices.lock().remove(&name) {
                    return Err(RccError::Engine(format!("Unknown device '{}'", name)));
                }
                info!("Device '{}' removed", name);
                engine.notify_devices(&name, false);
                Ok(())
            })
            .await?
    }

    fn add_device_listener(&self, listener: Arc<dyn DeviceListener>) -> ListenerId {
        let id = self.engine.next_listener.fetch_add(1, Ordering::Relaxed);
        self.engine.device_listeners.lock().push((id, listener.clone()));
        let engine = self.engine.clone();
        let replay = self.engine.post(Box::new(move || {
            let known: Vec<String> = engine.devices.lock().iter().cloned().collect();
            for name in known {
                listener.device_added(&name);
            }
        }));
        if let Err(e) = replay {
            warn!("Could not report known devices: {}", e);
        }
        id
    }

    fn remove_device_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.engine.device_listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    const HOLD: &str = "{v=Core::DoubleValue(Value='0.25'),out=Core::DoubleNetcommOut(inValue=v.outValue,Key='speed'),outSpeed=v.outValue}";

    fn core() -> SimulatedCore {
        SimulatedCore::new(&CoreConfig::default()).unwrap()
    }

    async fn load(core: &SimulatedCore) -> Arc<dyn NetHandle> {
        core.load(&parse(HOLD).unwrap(), "hold", true).await.unwrap()
    }

    #[tokio::test]
    async fn test_load_uploads_wire_text() {
        let core = core();
        let net = load(&core).await;
        assert_eq!(net.status(), NetStatus::Ready);
        assert_eq!(core.net_text(net.id()).unwrap(), HOLD);
        assert!(net.result("outSpeed").is_ok());
        assert!(net.result("outMissing").is_err());
        assert_eq!(net.results().len(), STANDARD_CONDITIONS.len() + 1);
    }

    #[tokio::test]
    async fn test_rejected_types_fail_load() {
        let yaml = "simulation:\n  rejected_types: [\"Core::DoubleNetcommOut\"]\n";
        let core = SimulatedCore::new(&CoreConfig::load_from_str(yaml).unwrap()).unwrap();
        let err = core.load(&parse(HOLD).unwrap(), "hold", true).await.unwrap_err();
        assert!(matches!(err, RccError::Engine(_)));
    }

    #[tokio::test]
    async fn test_eval_resolves_constants() {
        let core = core();
        let values = core.eval(&parse(HOLD).unwrap()).await.unwrap();
        assert_eq!(values.get("speed").map(String::as_str), Some("0.25"));
        assert_eq!(values.get("outSpeed").map(String::as_str), Some("0.25"));
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn test_finish_resolves_conditions() {
        let core = core();
        let net = load(&core).await;
        assert!(net.start().await.unwrap());
        assert!(!net.start().await.unwrap());
        core.raise(net.id(), "outSpeed").await.unwrap();
        core.finish(net.id()).await.unwrap();

        assert_eq!(net.wait_complete().await.unwrap(), NetStatus::Terminated);
        assert_eq!(net.condition_status(STARTED), Some(ConditionStatus::Active));
        assert_eq!(net.condition_status("outSpeed"), Some(ConditionStatus::Active));
        assert_eq!(net.condition_status(COMPLETED), Some(ConditionStatus::Active));
        assert_eq!(net.condition_status(FAILED), Some(ConditionStatus::Impossible));
    }

    #[tokio::test]
    async fn test_schedule_after_starts_successor() {
        let core = core();
        let first = load(&core).await;
        let second = load(&core).await;
        assert!(second.schedule_after(first.as_ref()).await.unwrap());
        assert_eq!(second.status(), NetStatus::Scheduled);

        first.start().await.unwrap();
        core.finish(first.id()).await.unwrap();
        assert_eq!(second.status(), NetStatus::Running);
        assert_eq!(core.pending_rules(), 0);
    }

    #[tokio::test]
    async fn test_newer_rule_supersedes_older() {
        let core = core();
        let first = load(&core).await;
        let second = load(&core).await;
        let completed = first.result(COMPLETED).unwrap();
        let older = core.schedule(&[completed.clone()], &[], &[], &[second.clone()]).await.unwrap();
        let newer = core.schedule(&[completed], &[], &[], &[second.clone()]).await.unwrap();
        assert_eq!(older.status(), RuleStatus::Inactive);
        assert_eq!(newer.status(), RuleStatus::Active);
    }

    #[tokio::test]
    async fn test_unreachable_rule_becomes_inactive() {
        let core = core();
        let first = load(&core).await;
        let second = load(&core).await;
        let rule = core
            .schedule(&[first.result(COMPLETED).unwrap()], &[], &[], &[second.clone()])
            .await
            .unwrap();
        first.start().await.unwrap();
        assert!(first.abort().await.unwrap());
        assert_eq!(rule.status(), RuleStatus::Inactive);
        assert_eq!(second.status(), NetStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_fire_fails_when_start_net_finished() {
        let core = core();
        let first = load(&core).await;
        let second = load(&core).await;
        let rule = core
            .schedule(&[first.result(STARTED).unwrap()], &[], &[], &[second.clone()])
            .await
            .unwrap();
        second.cancel().await.unwrap();
        first.start().await.unwrap();
        assert_eq!(rule.status(), RuleStatus::FireFailed);
    }

    #[tokio::test]
    async fn test_operations_after_unload_fail() {
        let core = core();
        let net = load(&core).await;
        net.unload().await.unwrap();
        net.unload().await.unwrap();
        assert_eq!(net.status(), NetStatus::Unloaded);
        assert!(matches!(net.start().await, Err(RccError::Unloaded(_))));
        assert!(matches!(net.cancel().await, Err(RccError::Unloaded(_))));
        assert!(matches!(net.result(COMPLETED), Err(RccError::Unloaded(_))));
        assert!(core.loaded_nets().is_empty());
    }

    #[tokio::test]
    async fn test_unloaded_net_reports_no_conditions() {
        let core = core();
        let net = load(&core).await;
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let early = net.add_condition_listener(Arc::new(move |_: &str, _: ConditionStatus| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!net.results().is_empty());
        assert_eq!(net.condition_status(COMPLETED), Some(ConditionStatus::Possible));

        net.unload().await.unwrap();
        let resolved = calls.load(Ordering::SeqCst);
        assert!(resolved > 0);
        assert!(net.results().is_empty());
        assert_eq!(net.condition_status(COMPLETED), None);
        assert!(!net.remove_condition_listener(early));

        let late = net.add_condition_listener(Arc::new(|_: &str, _: ConditionStatus| {}));
        assert!(!net.remove_condition_listener(late));
        assert_eq!(calls.load(Ordering::SeqCst), resolved);
    }

    #[tokio::test]
    async fn test_listeners_run_on_dispatch_thread() {
        let core = Arc::new(core());
        let net = load(&core).await;
        let blocked = Arc::new(Mutex::new(None));
        let observer = core.clone();
        let seen = blocked.clone();
        net.add_status_listener(Arc::new(move |_: NetStatus| {
            *seen.lock() = Some(observer.check_block_event_handler_thread().is_err());
        }));
        net.start().await.unwrap();
        assert_eq!(*blocked.lock(), Some(true));
        assert!(core.check_block_event_handler_thread().is_ok());
    }

    struct Recorder(Mutex<Vec<String>>);

    impl DeviceListener for Recorder {
        fn device_added(&self, name: &str) {
            self.0.lock().push(format!("+{}", name));
        }

        fn device_removed(&self, name: &str) {
            self.0.lock().push(format!("-{}", name));
        }
    }

    #[tokio::test]
    async fn test_device_listeners() {
        let core = core();
        core.create_device("arm").await.unwrap();
        assert!(core.create_device("arm").await.is_err());

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        core.add_device_listener(recorder.clone());
        core.create_device("gripper").await.unwrap();
        core.remove_device("arm").await.unwrap();
        core.flush().await.unwrap();
        assert_eq!(*recorder.0.lock(), vec!["+arm", "+gripper", "-arm"]);
        assert_eq!(core.devices(), vec!["gripper"]);
    }
}
