//! JSON lifecycle events
//!
//! One JSON object per line on stdout, so tools can follow nets and
//! schedules as they move through their states.

use crate::control_core::{ConditionStatus, NetId, NetStatus};
use crate::net::Fragment;
use crate::schedule::ScheduleStatus;
use serde::Serialize;

/// Seconds since the UNIX epoch, rounded to microseconds
pub fn current_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Net status change
#[derive(Debug, Clone, Serialize)]
pub struct NetEvent {
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    pub net: String,
    pub description: String,
    pub status: NetStatus,
}

/// A net condition resolved
#[derive(Debug, Clone, Serialize)]
pub struct ConditionEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub net: String,
    pub condition: String,
    pub status: ConditionStatus,
}

/// Schedule status change
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub schedule: String,
    pub status: ScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shape of a parsed net
#[derive(Debug, Clone, Serialize)]
pub struct NetSummary {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub primitives: usize,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub types: Vec<String>,
    pub netcomm_keys: Vec<String>,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub error: String,
}

impl NetEvent {
    pub fn new(net: NetId, description: &str, status: NetStatus) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "net_status".to_string(),
            net: net.to_string(),
            description: description.to_string(),
            status,
        }
    }
}

impl ConditionEvent {
    pub fn new(net: NetId, condition: &str, status: ConditionStatus) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "condition".to_string(),
            net: net.to_string(),
            condition: condition.to_string(),
            status,
        }
    }
}

impl ScheduleEvent {
    pub fn new(schedule: &str, status: ScheduleStatus) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "schedule_status".to_string(),
            schedule: schedule.to_string(),
            status,
            message: None,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}

impl NetSummary {
    pub fn of(fragment: &Fragment) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "net_summary".to_string(),
            primitives: fragment.len(),
            inputs: fragment.input_names().into_iter().map(str::to_string).collect(),
            outputs: fragment.output_names().into_iter().map(str::to_string).collect(),
            types: fragment.type_names(),
            netcomm_keys: fragment.netcomm_keys(),
            problems: fragment.validate(),
        }
    }
}

impl ErrorEvent {
    pub fn new(error: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            error: error.to_string(),
        }
    }
}

/// Print one event as a JSON line on stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}
