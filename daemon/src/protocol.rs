//! IPC protocol definitions (JSON messages between the daemon and its clients)

use crate::events::Event;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Status,
    Start,
    Stop,
    SetVisible { params: SetVisibleParams },
    GetIntensity,
    SetIntensity { params: SetIntensityParams },
    GetVersion,
    QueryTelemetry { params: QueryTelemetryParams },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVisibleParams {
    pub visible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetIntensityParams {
    pub value: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTelemetryParams {
    /// Window start in epoch milliseconds; defaults to `span_secs` before now.
    pub start_ms: Option<i64>,
    pub span_secs: u64,
    /// Pixels available to draw the window.
    pub density: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Response { id: Option<String>, data: serde_json::Value },
    Error { message: String },
    Event { data: Event },
}

impl Response {
    pub fn data(data: serde_json::Value) -> Self {
        Response::Response { id: None, data }
    }

    pub fn error(message: impl ToString) -> Self {
        Response::Error { message: message.to_string() }
    }
}
