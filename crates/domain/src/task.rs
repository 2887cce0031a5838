use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifies one (room, agent) generation slot.
///
/// Used as the key in both the client pool and the streaming-state
/// table. The string form `room_{n}_agent_{m}` travels in SSE events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentifier {
    pub room_id: i64,
    pub agent_id: i64,
}

impl TaskIdentifier {
    pub fn new(room_id: i64, agent_id: i64) -> Self {
        Self { room_id, agent_id }
    }
}

impl fmt::Display for TaskIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room_{}_agent_{}", self.room_id, self.agent_id)
    }
}

impl FromStr for TaskIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 4 || parts[0] != "room" || parts[2] != "agent" {
            return Err(Error::Validation(format!("invalid task ID format: {s}")));
        }
        let room_id = parts[1].parse::<i64>();
        let agent_id = parts[3].parse::<i64>();
        match (room_id, agent_id) {
            (Ok(room_id), Ok(agent_id)) => Ok(Self { room_id, agent_id }),
            _ => Err(Error::Validation(format!("invalid numeric IDs in task ID: {s}"))),
        }
    }
}
