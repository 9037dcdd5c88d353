//! Commands: units of work backed by one net on the control core

use crate::config::CoreConfig;
use crate::control_core::{CommandOperation, ControlCore, NetHandle, NetId, NetResult, NetStatus, CANCELLED, COMPLETED, FAILED};
use crate::net::Fragment;
use crate::{Result, RccError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::info;

/// How a command ended when one of its conditions occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Completion,
    Exception,
    Cancellation,
}

/// A loaded command: its name and the net executing it
#[derive(Debug, Clone)]
pub struct CommandHandle {
    command: String,
    net: Arc<dyn NetHandle>,
}

impl CommandHandle {
    pub fn new(command: &str, net: Arc<dyn NetHandle>) -> Self {
        Self {
            command: command.to_string(),
            net,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn net(&self) -> &Arc<dyn NetHandle> {
        &self.net
    }

    pub fn id(&self) -> NetId {
        self.net.id()
    }

    pub fn status(&self) -> NetStatus {
        self.net.status()
    }

    pub fn start_operation(&self) -> CommandOperation {
        CommandOperation::Start(self.net.clone())
    }

    pub fn abort_operation(&self) -> CommandOperation {
        CommandOperation::Abort(self.net.clone())
    }

    pub fn cancel_operation(&self) -> CommandOperation {
        CommandOperation::Cancel(self.net.clone())
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    /// Net conditions proving that this command ended with `kind`
    fn conditions(&self, kind: ResultKind) -> Vec<String>;

    /// Check that the command can be sent to the control core
    fn seal(&self) -> Result<()>;

    /// Load the backing net; loading a loaded command returns its handle
    async fn load(&self) -> Result<CommandHandle>;

    fn handle(&self) -> Option<CommandHandle>;

    async fn unload(&self) -> Result<()>;
}

/// One condition of a command, tagged with the outcome it proves
#[derive(Clone)]
pub struct CommandResult {
    command: Arc<dyn Command>,
    condition: String,
    kind: ResultKind,
}

impl CommandResult {
    pub fn new(command: &Arc<dyn Command>, condition: &str, kind: ResultKind) -> Self {
        Self {
            command: command.clone(),
            condition: condition.to_string(),
            kind,
        }
    }

    pub fn of_kind(command: &Arc<dyn Command>, kind: ResultKind) -> Vec<Self> {
        command
            .conditions(kind)
            .iter()
            .map(|condition| Self::new(command, condition, kind))
            .collect()
    }

    pub fn completions(command: &Arc<dyn Command>) -> Vec<Self> {
        Self::of_kind(command, ResultKind::Completion)
    }

    pub fn exceptions(command: &Arc<dyn Command>) -> Vec<Self> {
        Self::of_kind(command, ResultKind::Exception)
    }

    pub fn cancellations(command: &Arc<dyn Command>) -> Vec<Self> {
        Self::of_kind(command, ResultKind::Cancellation)
    }

    pub fn command(&self) -> &Arc<dyn Command> {
        &self.command
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    pub fn handle(&self) -> Result<CommandHandle> {
        self.command.handle().ok_or_else(|| {
            RccError::Schedule(format!("Command '{}' is not loaded", self.command.name()))
        })
    }

    /// The engine condition behind this result; the command must be loaded
    pub fn net_result(&self) -> Result<NetResult> {
        self.handle()?.net().result(&self.condition)
    }

    fn key(&self) -> (&str, usize, &str) {
        (
            self.command.name(),
            Arc::as_ptr(&self.command) as *const () as usize,
            &self.condition,
        )
    }
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({:?})", self.command.name(), self.condition, self.kind)
    }
}

impl PartialEq for CommandResult {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CommandResult {}

impl Hash for CommandResult {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for CommandResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommandResult {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Command executing a prepared net
pub struct NetCommand {
    name: String,
    fragment: Fragment,
    core: Arc<dyn ControlCore>,
    description: String,
    realtime: bool,
    extra_conditions: Vec<(ResultKind, String)>,
    handle: Mutex<Option<CommandHandle>>,
}

impl NetCommand {
    pub fn new(name: &str, fragment: Fragment, core: Arc<dyn ControlCore>, config: &CoreConfig) -> Self {
        Self {
            name: name.to_string(),
            fragment,
            core,
            description: format!("{}:{}", config.description_prefix(), name),
            realtime: config.realtime(),
            extra_conditions: Vec::new(),
            handle: Mutex::new(None),
        }
    }

    /// Treat boolean output `condition` of the net as proof of `kind`
    pub fn with_condition(mut self, kind: ResultKind, condition: &str) -> Self {
        self.extra_conditions.push((kind, condition.to_string()));
        self
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

#[async_trait]
impl Command for NetCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn conditions(&self, kind: ResultKind) -> Vec<String> {
        let standard = match kind {
            ResultKind::Completion => COMPLETED,
            ResultKind::Exception => FAILED,
            ResultKind::Cancellation => CANCELLED,
        };
        std::iter::once(standard.to_string())
            .chain(
                self.extra_conditions
                    .iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, condition)| condition.clone()),
            )
            .collect()
    }

    fn seal(&self) -> Result<()> {
        let problems = self.fragment.validate();
        if !problems.is_empty() {
            return Err(RccError::Connection(format!(
                "Net of command '{}' cannot be sealed: {}",
                self.name,
                problems.join("; ")
            )));
        }
        let outputs = self.fragment.output_names();
        if let Some((_, missing)) = self
            .extra_conditions
            .iter()
            .find(|(_, condition)| !outputs.contains(&condition.as_str()))
        {
            return Err(RccError::Schedule(format!(
                "Command '{}' has no output '{}' to use as a condition",
                self.name, missing
            )));
        }
        Ok(())
    }

    async fn load(&self) -> Result<CommandHandle> {
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }
        self.seal()?;
        let net = self
            .core
            .load(&self.fragment, &self.description, self.realtime)
            .await?;
        info!("Loaded command '{}' as {}", self.name, net.id());
        let handle = CommandHandle::new(&self.name, net);
        *self.handle.lock() = Some(handle.clone());
        Ok(handle)
    }

    fn handle(&self) -> Option<CommandHandle> {
        self.handle.lock().clone()
    }

    async fn unload(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.net().unload().await?;
            info!("Unloaded command '{}' ({})", self.name, handle.id());
        }
        Ok(())
    }
}
