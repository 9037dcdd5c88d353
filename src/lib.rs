//! rccnet - real-time control nets and their coordination
//!
//! This library builds dataflow nets of typed primitives, moves them to and
//! from their compact wire text, and coordinates their execution on a
//! control core through synchronization rules. Activities are expressed as
//! schedules whose possible outcomes are derived from net conditions.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rccnet::{parse, ActivitySchedule, CommandResult, CoreConfig, NetCommand, RuntimeResult, RuntimeSchedule, SimulatedCore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::default();
//!     let core = Arc::new(SimulatedCore::new(&config)?);
//!
//!     let net = parse("{v=Core::DoubleValue(Value='0.5'),out=Core::DoubleNetcommOut(inValue=v.outValue,Key='speed')}")?;
//!     let command: Arc<dyn rccnet::Command> = Arc::new(NetCommand::new("hold", net, core.clone(), &config));
//!
//!     let schedule = RuntimeSchedule::builder("hold", core.clone())
//!         .command(command.clone())
//!         .predecessor(RuntimeResult::fresh(&["arm"]))
//!         .result(RuntimeResult::completion(CommandResult::completions(&command), &["arm"]))
//!         .build();
//!     schedule.load().await?;
//!     schedule.activate().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Fragment / Primitive**: the net graph, an arena of named children
//! - **NetParser / serialize**: the wire text codec
//! - **ControlCore / NetHandle**: the engine boundary
//! - **NetSynchronizationRule**: conditional start, stop and cancel of nets
//! - **RuntimeResult / RuntimeSchedule**: activity outcomes and their lifecycle
//! - **SimulatedCore**: an in-process engine for tests and dry runs

pub mod command;
pub mod config;
pub mod control_core;
pub mod error;
pub mod events;
pub mod net;
pub mod parser;
pub mod result;
pub mod schedule;
pub mod serializer;
pub mod simulation;
pub mod status;
pub mod sync_rule;
pub mod value;

pub use command::{Command, CommandHandle, CommandResult, NetCommand, ResultKind};
pub use config::CoreConfig;
pub use control_core::{
    CommandOperation, ConditionStatus, ControlCore, DeviceListener, NetHandle, NetId, NetResult, NetStatus,
};
pub use error::{RccError, Result};
pub use net::{Fragment, Node, OutPortRef, Primitive, PrimitiveCatalog, PrimitiveId, PrimitiveKind};
pub use parser::{parse, NetParser};
pub use result::{ActivityResult, ResultStatus, RuntimeResult};
pub use schedule::{ActivityHandle, ActivitySchedule, RuntimeSchedule, ScheduleStatus};
pub use serializer::serialize;
pub use simulation::SimulatedCore;
pub use status::{Observable, StateMachine};
pub use sync_rule::{NetSynchronizationRule, RuleStatus};
pub use value::{Value, ValueType};
