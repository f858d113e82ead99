use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the combo detector currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComboPhase {
    /// Combo not satisfied, nothing pending.
    Idle,
    /// Combo satisfied, dwell timer running.
    Arming,
    /// Dwell elapsed and the held action ran; waiting for the combo to break.
    Held,
}

impl fmt::Display for ComboPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComboPhase::Idle => "idle",
            ComboPhase::Arming => "arming",
            ComboPhase::Held => "held",
        };
        f.write_str(name)
    }
}

/// Snapshot of the detector reported over IPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboStatus {
    pub phase: ComboPhase,
    pub down_pressed: usize,
    pub down_target: usize,
    pub up_pressed: usize,
    pub held_leases: usize,
    pub up_leases: usize,
    pub held_fired: u64,
    pub released_fired: u64,
}

/// Messages from daemon to clients (JSON-lines over Unix socket).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonMsg {
    /// Status response.
    #[serde(rename = "status")]
    Status { status: ComboStatus, version: String },
    /// Acknowledgement for commands.
    #[serde(rename = "ack")]
    Ack { ok: bool, message: String },
}

/// Messages from clients to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    /// Request current status.
    #[serde(rename = "get_status")]
    GetStatus,
    /// Ask the daemon to tear down and exit.
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Serialize a message as a JSON line (with trailing newline).
pub fn encode(msg: &impl Serialize) -> String {
    let mut s = serde_json::to_string(msg).expect("serialize IPC message");
    s.push('\n');
    s
}

/// Deserialize a JSON line. Returns None on empty/whitespace input.
pub fn decode_daemon(line: &str) -> Option<DaemonMsg> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

pub fn decode_client(line: &str) -> Option<ClientMsg> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
