//! Miner API wire format (cgminer-style JSON request/response)

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SUMMARY: &str = "summary";
pub const DEVS: &str = "devs";
pub const VERSION: &str = "version";
pub const QUIT: &str = "quit";
pub const GPU_INTENSITY: &str = "gpuintensity";

/// A single request. Serialized as `{"command": .., "parameter": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parameter: Option<String>,
}

impl Command {
    pub fn new(command: &str) -> Self {
        Self { command: command.to_string(), parameter: None }
    }

    pub fn summary() -> Self {
        Self::new(SUMMARY)
    }

    pub fn devs() -> Self {
        Self::new(DEVS)
    }

    pub fn version() -> Self {
        Self::new(VERSION)
    }

    pub fn quit() -> Self {
        Self::new(QUIT)
    }

    pub fn gpu_intensity(device: u32, value: i32) -> Self {
        Self {
            command: GPU_INTENSITY.to_string(),
            parameter: Some(format!("{},{}", device, value)),
        }
    }

    pub fn is_quit(&self) -> bool {
        self.command == QUIT
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatusKind {
    #[default]
    Unknown,
    Warning,
    Informational,
    Success,
    Error,
    Fatal,
}

impl StatusKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "W" => StatusKind::Warning,
            "I" => StatusKind::Informational,
            "S" => StatusKind::Success,
            "E" => StatusKind::Error,
            "F" => StatusKind::Fatal,
            _ => StatusKind::Unknown,
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusKind::Unknown => "Unknown",
            StatusKind::Warning => "Warning",
            StatusKind::Informational => "Informational",
            StatusKind::Success => "Success",
            StatusKind::Error => "Error",
            StatusKind::Fatal => "Fatal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusEntry {
    #[serde(rename = "STATUS", default, deserialize_with = "status_kind")]
    pub kind: StatusKind,
    #[serde(rename = "When", default)]
    pub when: i64,
    #[serde(rename = "Code", default)]
    pub code: i64,
    #[serde(rename = "Msg", default)]
    pub message: String,
    #[serde(rename = "Description", default)]
    pub description: String,
}

fn status_kind<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatusKind, D::Error> {
    let code = String::deserialize(deserializer)?;
    Ok(StatusKind::from_code(&code))
}

/// Integer field that some miner builds report as a numeric string.
fn lenient_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => i32::try_from(v).map_err(de::Error::custom),
        Raw::Float(v) => Ok(v as i32),
        Raw::Text(s) => s
            .trim()
            .parse::<i32>()
            .map_err(|_| de::Error::custom(format!("non-numeric value {:?}", s))),
    }
}

fn yes_no<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let flag = String::deserialize(deserializer)?;
    Ok(flag == "Y")
}

/// Anything carrying the leading `STATUS` array.
pub trait Reply: DeserializeOwned {
    fn statuses(&self) -> &[StatusEntry];

    fn status(&self) -> Option<&StatusEntry> {
        self.statuses().first()
    }
}

/// Response with no command-specific payload (`version`, `gpuintensity`, `quit`).
#[derive(Debug, Clone, Deserialize)]
pub struct StatusReply {
    #[serde(rename = "STATUS", default)]
    pub statuses: Vec<StatusEntry>,
    #[serde(default)]
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryReply {
    #[serde(rename = "STATUS", default)]
    pub statuses: Vec<StatusEntry>,
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "SUMMARY", default)]
    pub summary: Vec<SummaryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesReply {
    #[serde(rename = "STATUS", default)]
    pub statuses: Vec<StatusEntry>,
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "DEVS", default)]
    pub devices: Vec<Device>,
}

impl Reply for StatusReply {
    fn statuses(&self) -> &[StatusEntry] {
        &self.statuses
    }
}

impl Reply for SummaryReply {
    fn statuses(&self) -> &[StatusEntry] {
        &self.statuses
    }
}

impl Reply for DevicesReply {
    fn statuses(&self) -> &[StatusEntry] {
        &self.statuses
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SummaryEntry {
    #[serde(rename = "Elapsed")]
    pub elapsed: i64,
    #[serde(rename = "MHS av")]
    pub mhs_average: f64,
    #[serde(rename = "MHS 5s")]
    pub mhs_5s: f64,
    #[serde(rename = "Accepted")]
    pub accepted: i64,
    #[serde(rename = "Rejected")]
    pub rejected: i64,
    #[serde(rename = "Hardware Errors")]
    pub hardware_errors: i64,
    #[serde(rename = "Stale")]
    pub stale: i64,
    #[serde(rename = "Utility")]
    pub utility: f64,
}

/// Per-device snapshot from `devs`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Device {
    #[serde(rename = "GPU")]
    pub gpu: u32,
    #[serde(rename = "Enabled", deserialize_with = "yes_no")]
    pub enabled: bool,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Temperature")]
    pub temperature: f64,
    #[serde(rename = "Fan Speed")]
    pub fan_speed: i64,
    #[serde(rename = "Fan Percent")]
    pub fan_percent: f64,
    #[serde(rename = "GPU Clock")]
    pub gpu_clock: i64,
    #[serde(rename = "Memory Clock")]
    pub memory_clock: i64,
    #[serde(rename = "GPU Voltage")]
    pub gpu_voltage: f64,
    #[serde(rename = "GPU Activity")]
    pub gpu_activity: f64,
    #[serde(rename = "Powertune")]
    pub powertune: i64,
    #[serde(rename = "MHS av")]
    pub mhs_average: f64,
    #[serde(rename = "MHS 5s")]
    pub mhs_5s: f64,
    #[serde(rename = "Accepted")]
    pub accepted: i64,
    #[serde(rename = "Rejected")]
    pub rejected: i64,
    #[serde(rename = "Hardware Errors")]
    pub hardware_errors: i64,
    #[serde(rename = "Utility")]
    pub utility: f64,
    #[serde(rename = "Intensity", deserialize_with = "lenient_i32")]
    pub intensity: i32,
    #[serde(rename = "Last Share Pool")]
    pub last_share_pool: i64,
    #[serde(rename = "Last Share Time")]
    pub last_share_time: i64,
    #[serde(rename = "Total MH")]
    pub total_mh: f64,
    #[serde(rename = "Diff1 Work")]
    pub diff1_work: i64,
    #[serde(rename = "Difficulty Accepted")]
    pub difficulty_accepted: f64,
    #[serde(rename = "Difficulty Rejected")]
    pub difficulty_rejected: f64,
    #[serde(rename = "Last Share Difficulty")]
    pub last_share_difficulty: f64,
    #[serde(rename = "Last Valid Work")]
    pub last_valid_work: i64,
    #[serde(rename = "Device Hardware%")]
    pub device_hardware_percent: f64,
    #[serde(rename = "Device Rejected%")]
    pub device_rejected_percent: f64,
    #[serde(rename = "Device Elapsed")]
    pub device_elapsed: i64,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty response")]
    Empty,
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("response carried no STATUS entry")]
    NoStatus,
    #[error("unexpected status [{kind}] [{message}]")]
    Status { kind: StatusKind, message: String },
    #[error("no devices reported")]
    NoDevices,
}

/// Parse a raw payload. Trailing NULs and whitespace are ignored.
pub fn parse<T: Reply>(payload: &[u8]) -> Result<T, WireError> {
    let end = payload
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    if end == 0 {
        return Err(WireError::Empty);
    }
    Ok(serde_json::from_slice(&payload[..end])?)
}

/// First status entry, or an error if it is missing or not `expected`.
pub fn expect_status<T: Reply>(reply: &T, expected: StatusKind) -> Result<&StatusEntry, WireError> {
    let status = reply.status().ok_or(WireError::NoStatus)?;
    if status.kind != expected {
        return Err(WireError::Status { kind: status.kind, message: status.message.clone() });
    }
    Ok(status)
}
