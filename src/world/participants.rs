use crate::world::position::Position;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

/// What the activation sweep needs to know about one connected participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub id: ParticipantId,
    pub position: Position,
    /// Spectators and participants without spawner permission keep nothing running.
    #[serde(default = "default_eligible")]
    pub eligible: bool,
}

fn default_eligible() -> bool {
    true
}

/// World-layer view of connected participants.
pub trait ParticipantSource: Send + Sync {
    fn snapshot(&self) -> Vec<ParticipantSnapshot>;
}

/// Participant list held in memory and updated by whoever owns sessions.
#[derive(Debug, Default)]
pub struct ParticipantList {
    participants: Mutex<Vec<ParticipantSnapshot>>,
}

impl ParticipantList {
    pub fn new(participants: Vec<ParticipantSnapshot>) -> Self {
        Self {
            participants: Mutex::new(participants),
        }
    }

    /// Inserts or replaces the entry for `participant.id`.
    pub fn upsert(&self, participant: ParticipantSnapshot) {
        let mut participants = self
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match participants.iter_mut().find(|entry| entry.id == participant.id) {
            Some(entry) => *entry = participant,
            None => participants.push(participant),
        }
    }

    pub fn remove(&self, id: ParticipantId) {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.id != id);
    }
}

impl ParticipantSource for ParticipantList {
    fn snapshot(&self) -> Vec<ParticipantSnapshot> {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
