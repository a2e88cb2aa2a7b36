//! dyad-core — shared types, wire format, trial records and configuration.
//! All other Dyad crates depend on this one.

pub mod config;
pub mod trial;
pub mod wire;

pub use config::DyadConfig;
pub use trial::{SpatialLayout, TrialLog, TrialLogBook};
pub use wire::{
    Category, ControlMessage, Envelope, GazeSample, MessageKind, PeerRole, ResponseRecord,
    TrialParameters, WireError,
};
