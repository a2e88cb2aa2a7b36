//! Dyad wire format — on-wire types for both peer channels.
//!
//! Control datagrams are a single JSON object:
//!
//!   {"v":1,"type":"stage_grid_display","timestamp":1712.5,"data":{...}}
//!
//! `type` selects one of a closed set of payloads. Anything outside that set,
//! an unknown envelope version, or a payload that does not match its type is a
//! decode error: the datagram is dropped and counted, never acted on.
//!
//! Gaze datagrams are a flat JSON object with no envelope. They are
//! high-frequency and loss-tolerant, so they carry their own sequence number
//! and the receiver keeps only the newest.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current control envelope version. A missing `v` is read as this value.
pub const WIRE_VERSION: u8 = 0x01;

/// Cells in the 8x8 stimulus grid.
pub const GRID_CELLS: usize = 64;

/// Side length of the stimulus grid.
pub const GRID_SIDE: usize = 8;

/// Receive buffer size for both channels. A grid display message with a full
/// condition array is well under 1 KiB.
pub const MAX_DATAGRAM: usize = 4096;

/// Default built-in condition layout, used when none are configured.
pub const DEFAULT_CONDITION: [u8; GRID_CELLS] = [
    2, 0, 1, 3, 2, 3, 0, 1, 3, 1, 2, 1, 0, 2, 0, 3, //
    1, 3, 2, 0, 3, 1, 0, 2, 0, 2, 3, 1, 2, 0, 1, 3, //
    3, 2, 0, 1, 1, 0, 3, 2, 2, 3, 1, 0, 1, 3, 2, 0, //
    0, 1, 3, 2, 3, 2, 1, 0, 1, 0, 2, 3, 3, 1, 0, 2,
];

/// Sender clock in seconds since the Unix epoch.
///
/// Both peers stamp with their own wall clock. There is no clock agreement,
/// so differences between the two are only ever best-effort.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── Peers and categories ──────────────────────────────────────────────────────

/// Which side of the session a peer plays.
///
/// The initiator is authoritative for trial parameters, seeds and scoring.
/// The follower mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Initiator,
    Follower,
}

impl PeerRole {
    pub fn other(self) -> Self {
        match self {
            PeerRole::Initiator => PeerRole::Follower,
            PeerRole::Follower => PeerRole::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Initiator => "initiator",
            PeerRole::Follower => "follower",
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeerRole {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initiator" | "server" | "a" => Ok(PeerRole::Initiator),
            "follower" | "client" | "b" => Ok(PeerRole::Follower),
            other => Err(WireError::UnknownRole(other.to_string())),
        }
    }
}

/// Stimulus category shown in a grid cell.
///
/// Condition arrays encode categories as 0..=3 in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Face,
    Limb,
    House,
    Car,
}

impl Category {
    pub const ALL: [Category; 4] = [Category::Face, Category::Limb, Category::House, Category::Car];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Response key mapping: f / l / h / c, case-insensitive.
    pub fn from_key(key: char) -> Option<Self> {
        match key.to_ascii_lowercase() {
            'f' => Some(Category::Face),
            'l' => Some(Category::Limb),
            'h' => Some(Category::House),
            'c' => Some(Category::Car),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Face => "face",
            Category::Limb => "limb",
            Category::House => "house",
            Category::Car => "car",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Trial parameters ──────────────────────────────────────────────────────────

/// Everything a follower needs to rebuild the initiator's grid for one trial.
///
/// Created once by the initiator and sent verbatim in `stage_grid_display`.
/// `target_position` and `target_category` are authoritative: the follower
/// uses them as given and never re-derives them from the condition array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct TrialParameters {
    pub trial_number: u32,
    pub seed: u64,
    pub condition_array: Vec<u8>,
    pub target_position: u8,
    pub target_category: Category,
}

impl TrialParameters {
    /// Derive a trial from a seed: pick one of `conditions`, then a target cell.
    pub fn generate(trial_number: u32, seed: u64, conditions: &[Vec<u8>]) -> Result<Self, WireError> {
        if conditions.is_empty() {
            return Err(WireError::NoConditions);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let condition_array = conditions[rng.gen_range(0..conditions.len())].clone();
        validate_condition(&condition_array)?;

        let target_position = rng.gen_range(0..GRID_CELLS) as u8;
        let target_category = Category::from_index(condition_array[target_position as usize])
            .ok_or(WireError::ConditionValue(condition_array[target_position as usize]))?;

        Ok(Self {
            trial_number,
            seed,
            condition_array,
            target_position,
            target_category,
        })
    }

    /// Structural checks applied on decode. Does not cross-check the target
    /// category against the condition array.
    pub fn validate(&self) -> Result<(), WireError> {
        validate_condition(&self.condition_array)?;
        if self.target_position as usize >= GRID_CELLS {
            return Err(WireError::TargetOutOfRange(self.target_position));
        }
        Ok(())
    }

    /// Category of every cell, row-major from the top-left.
    pub fn categories(&self) -> Vec<Category> {
        self.condition_array
            .iter()
            .filter_map(|&c| Category::from_index(c))
            .collect()
    }
}

/// A condition array must have exactly 64 entries, each a category index.
pub fn validate_condition(condition: &[u8]) -> Result<(), WireError> {
    if condition.len() != GRID_CELLS {
        return Err(WireError::ConditionLength(condition.len()));
    }
    if let Some(&bad) = condition.iter().find(|&&c| Category::from_index(c).is_none()) {
        return Err(WireError::ConditionValue(bad));
    }
    Ok(())
}

// ── Control payloads ──────────────────────────────────────────────────────────

/// Stage named in a `stage_sync_ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    GridDisplay,
    ResponseCollection,
    Feedback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct SessionStart {
    pub total_trials: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct StartAck {
    pub client_ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct SyncAck {
    pub ready: bool,
    pub stage: Stage,
    pub trial_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct ResponseStage {
    pub trial_number: u32,
}

/// One peer's answer for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct ResponseRecord {
    pub responder: PeerRole,
    pub response: Category,
    /// Seconds from the start of the responder's own response stage.
    pub reaction_time: f64,
}

/// `response_update` — a ResponseRecord tagged with its trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct ResponseUpdate {
    pub trial_number: u32,
    pub responder: PeerRole,
    pub response: Category,
    pub reaction_time: f64,
}

impl ResponseUpdate {
    pub fn new(trial_number: u32, record: &ResponseRecord) -> Self {
        Self {
            trial_number,
            responder: record.responder,
            response: record.response,
            reaction_time: record.reaction_time,
        }
    }

    pub fn record(&self) -> ResponseRecord {
        ResponseRecord {
            responder: self.responder,
            response: self.response,
            reaction_time: self.reaction_time,
        }
    }
}

/// `stage_feedback` — the single source of truth for the trial's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct Feedback {
    pub trial_number: u32,
    pub trial_score: u32,
    pub total_score: u32,
    /// None when neither peer answered before the response timeout.
    pub first_responder: Option<PeerRole>,
    pub first_response: Option<Category>,
    pub correct_category: Category,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct SessionEnd {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct Heartbeat {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(debug_assertions, serde(deny_unknown_fields))]
pub struct HeartbeatReply {
    pub client_ready: bool,
}

// ── Control message ───────────────────────────────────────────────────────────

/// The closed set of control-channel messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlMessage {
    StartExperiment(SessionStart),
    AckStart(StartAck),
    StageGridDisplay(TrialParameters),
    StageSyncAck(SyncAck),
    StageResponse(ResponseStage),
    ResponseUpdate(ResponseUpdate),
    StageFeedback(Feedback),
    EndExperiment(SessionEnd),
    Ping(Heartbeat),
    Pong(HeartbeatReply),
}

/// Discriminant of [`ControlMessage`], used for type-filtered waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    StartExperiment,
    AckStart,
    StageGridDisplay,
    StageSyncAck,
    StageResponse,
    ResponseUpdate,
    StageFeedback,
    EndExperiment,
    Ping,
    Pong,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::StartExperiment => "start_experiment",
            MessageKind::AckStart => "ack_start",
            MessageKind::StageGridDisplay => "stage_grid_display",
            MessageKind::StageSyncAck => "stage_sync_ack",
            MessageKind::StageResponse => "stage_response",
            MessageKind::ResponseUpdate => "response_update",
            MessageKind::StageFeedback => "stage_feedback",
            MessageKind::EndExperiment => "end_experiment",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::StartExperiment(_) => MessageKind::StartExperiment,
            ControlMessage::AckStart(_) => MessageKind::AckStart,
            ControlMessage::StageGridDisplay(_) => MessageKind::StageGridDisplay,
            ControlMessage::StageSyncAck(_) => MessageKind::StageSyncAck,
            ControlMessage::StageResponse(_) => MessageKind::StageResponse,
            ControlMessage::ResponseUpdate(_) => MessageKind::ResponseUpdate,
            ControlMessage::StageFeedback(_) => MessageKind::StageFeedback,
            ControlMessage::EndExperiment(_) => MessageKind::EndExperiment,
            ControlMessage::Ping(_) => MessageKind::Ping,
            ControlMessage::Pong(_) => MessageKind::Pong,
        }
    }

    pub fn end(reason: impl Into<String>) -> Self {
        ControlMessage::EndExperiment(SessionEnd {
            reason: Some(reason.into()),
        })
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A control message with its sender-side header.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: u8,
    /// Sender clock at encode time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub body: ControlMessage,
}

impl Envelope {
    /// Wrap a message stamped with the current time.
    pub fn now(body: ControlMessage) -> Self {
        Self {
            version: WIRE_VERSION,
            timestamp: now_secs(),
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut value = serde_json::to_value(&self.body).map_err(WireError::Encode)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("v".to_string(), self.version.into());
            obj.insert("timestamp".to_string(), self.timestamp.into());
        }
        serde_json::to_vec(&value).map_err(WireError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(WireError::Decode)?;
        let obj = value.as_object_mut().ok_or(WireError::NotAnObject)?;

        let version = match obj.remove("v") {
            None => WIRE_VERSION,
            Some(v) => v
                .as_u64()
                .and_then(|v| u8::try_from(v).ok())
                .ok_or(WireError::MissingField("v"))?,
        };
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let timestamp = obj
            .remove("timestamp")
            .and_then(|t| t.as_f64())
            .ok_or(WireError::MissingField("timestamp"))?;

        let body: ControlMessage = serde_json::from_value(value).map_err(WireError::Decode)?;
        if let ControlMessage::StageGridDisplay(params) = &body {
            params.validate()?;
        }

        Ok(Self {
            version,
            timestamp,
            body,
        })
    }
}

// ── Gaze sample ───────────────────────────────────────────────────────────────

/// One gaze position, as streamed on the gaze channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GazeSample {
    pub x: f64,
    pub y: f64,
    /// False when the tracker reported missing/invalid data. Still sent.
    pub valid: bool,
    /// Sender clock, seconds since the Unix epoch.
    pub timestamp: f64,
    pub origin: PeerRole,
    /// Per-sender monotonic counter.
    pub seq: u64,
    /// Trial this sample was recorded in, if any.
    #[serde(default)]
    pub trial: Option<u32>,
}

impl GazeSample {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed datagram: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("datagram is not a JSON object")]
    NotAnObject,

    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    #[error("unsupported envelope version: 0x{0:02x}")]
    UnsupportedVersion(u8),

    #[error("condition array has {0} cells, expected {}", GRID_CELLS)]
    ConditionLength(usize),

    #[error("condition value {0} is not a category index")]
    ConditionValue(u8),

    #[error("target position {0} is outside the grid")]
    TargetOutOfRange(u8),

    #[error("no condition arrays to choose from")]
    NoConditions,

    #[error("unknown peer role: {0}")]
    UnknownRole(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
