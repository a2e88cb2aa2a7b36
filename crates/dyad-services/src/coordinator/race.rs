//! First-responder race within one trial's response stage.
//!
//! Each peer runs its own race over its own arrival order. The result only
//! drives the local feedback signal; what gets logged comes from the
//! initiator's `stage_feedback`.

use dyad_core::wire::{Category, PeerRole, ResponseRecord};

/// What an observed response did to the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceEvent {
    /// First response of the trial. The feedback signal fires.
    First,
    /// The other peer's slot was filled after someone already answered.
    Later,
    /// That peer already answered this trial; ignored.
    Duplicate,
    /// Claimed to come from a peer that cannot be the sender; ignored.
    Foreign,
}

#[derive(Debug, Clone)]
pub struct ResponseRace {
    role: PeerRole,
    local: Option<ResponseRecord>,
    remote: Option<ResponseRecord>,
    first: Option<ResponseRecord>,
}

impl ResponseRace {
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            local: None,
            remote: None,
            first: None,
        }
    }

    pub fn observe_local(&mut self, response: Category, reaction_time: f64) -> RaceEvent {
        if self.local.is_some() {
            return RaceEvent::Duplicate;
        }
        let record = ResponseRecord {
            responder: self.role,
            response,
            reaction_time,
        };
        self.local = Some(record.clone());
        self.settle(record)
    }

    pub fn observe_remote(&mut self, record: ResponseRecord) -> RaceEvent {
        if record.responder != self.role.other() {
            return RaceEvent::Foreign;
        }
        if self.remote.is_some() {
            return RaceEvent::Duplicate;
        }
        self.remote = Some(record.clone());
        self.settle(record)
    }

    fn settle(&mut self, record: ResponseRecord) -> RaceEvent {
        if self.first.is_some() {
            RaceEvent::Later
        } else {
            self.first = Some(record);
            RaceEvent::First
        }
    }

    pub fn first(&self) -> Option<&ResponseRecord> {
        self.first.as_ref()
    }

    pub fn local(&self) -> Option<&ResponseRecord> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&ResponseRecord> {
        self.remote.as_ref()
    }

    pub fn has_local(&self) -> bool {
        self.local.is_some()
    }

    /// Both peers have answered.
    pub fn complete(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }
}
