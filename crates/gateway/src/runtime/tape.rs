//! Tape generation and execution.
//!
//! A tape is the ordered list of agent turns for one round. Round 0
//! covers every agent in the room; follow-up rounds cover the agents
//! whose interlocutors have said something new, plus the agents marked
//! interrupt-every-turn. Turns run strictly one after another.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use ag_domain::types::TurnOutcome;
use ag_store::records::AgentRecord;
use ag_store::Store;

use super::generator::ResponseGenerator;

/// One scheduled agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnDescriptor {
    pub agent_id: i64,
    pub is_follow_up_round: bool,
    pub round_index: u32,
}

/// An ordered round of turns.
#[derive(Debug, Clone, Default)]
pub struct Tape {
    pub turns: Vec<TurnDescriptor>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TapeGenerator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TapeGenerator {
    agents: Vec<AgentRecord>,
    interrupt_agent_ids: Vec<i64>,
}

impl TapeGenerator {
    pub fn new(agents: Vec<AgentRecord>, interrupt_agent_ids: Vec<i64>) -> Self {
        Self {
            agents,
            interrupt_agent_ids,
        }
    }

    /// Round 0: every agent, priority descending, insertion order among
    /// equals.
    pub fn generate_initial_round(&self) -> Tape {
        let ordered = self.ordered_agents(|_| true);
        Tape {
            turns: ordered
                .into_iter()
                .map(|agent_id| TurnDescriptor {
                    agent_id,
                    is_follow_up_round: false,
                    round_index: 0,
                })
                .collect(),
        }
    }

    /// Round k>0: eligible agents (new interlocutor activity) plus
    /// always-interrupting agents, same ordering rule.
    pub fn generate_follow_up_round(&self, round_index: u32, eligible_ids: &[i64]) -> Tape {
        let ordered = self.ordered_agents(|agent| {
            eligible_ids.contains(&agent.id) || self.interrupt_agent_ids.contains(&agent.id)
        });
        Tape {
            turns: ordered
                .into_iter()
                .map(|agent_id| TurnDescriptor {
                    agent_id,
                    is_follow_up_round: true,
                    round_index,
                })
                .collect(),
        }
    }

    fn ordered_agents(&self, include: impl Fn(&AgentRecord) -> bool) -> Vec<i64> {
        let mut selected: Vec<&AgentRecord> = self.agents.iter().filter(|a| include(a)).collect();
        // Stable sort keeps insertion order among equal priorities.
        selected.sort_by(|a, b| b.priority.cmp(&a.priority));
        selected.iter().map(|a| a.id).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TapeExecutor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result flags of one executed round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TapeExecution {
    /// Every executed turn skipped (and the round actually ran).
    pub all_skipped: bool,
    pub total_responses: u32,
    pub was_paused: bool,
    pub was_interrupted: bool,
}

/// Runs one tape linearly. A turn failure is logged and the tape moves
/// on; pause and interruption stop the round.
pub struct TapeExecutor<'a> {
    pub generator: &'a ResponseGenerator,
    pub store: &'a Store,
    pub room_id: i64,
    /// When this handling began; a later user-message arrival means we
    /// were interrupted.
    pub handling_started: Instant,
    pub last_user_message_time: &'a Mutex<HashMap<i64, Instant>>,
}

impl TapeExecutor<'_> {
    pub async fn execute(
        &self,
        tape: &Tape,
        agents: &[AgentRecord],
        user_message: Option<&str>,
    ) -> TapeExecution {
        let mut execution = TapeExecution::default();
        let mut ran_any_turn = false;
        let mut all_skipped = true;

        for descriptor in &tape.turns {
            if self.interrupted() {
                execution.was_interrupted = true;
                break;
            }
            match self.store.get_room(self.room_id) {
                Ok(Some(room)) if room.is_paused => {
                    execution.was_paused = true;
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(room_id = self.room_id, error = %e, "room lookup failed mid-tape");
                    break;
                }
            }

            let Some(agent) = agents.iter().find(|a| a.id == descriptor.agent_id) else {
                continue;
            };
            let turn_user_message = if descriptor.is_follow_up_round {
                None
            } else {
                user_message
            };

            ran_any_turn = true;
            match self
                .generator
                .generate_response(self.room_id, agent, turn_user_message, false)
                .await
            {
                Ok(TurnOutcome::Responded) => {
                    execution.total_responses += 1;
                    all_skipped = false;
                }
                Ok(TurnOutcome::Skipped) => {}
                Ok(TurnOutcome::Cancelled) => {
                    execution.was_interrupted = true;
                    break;
                }
                Ok(TurnOutcome::Errored(message)) => {
                    // Errors never finish the room.
                    all_skipped = false;
                    tracing::error!(
                        room_id = self.room_id,
                        agent_id = agent.id,
                        error = %message,
                        "turn errored, continuing tape"
                    );
                }
                Err(e) => {
                    all_skipped = false;
                    tracing::error!(
                        room_id = self.room_id,
                        agent_id = agent.id,
                        error = %e,
                        "turn failed, continuing tape"
                    );
                }
            }
        }

        execution.all_skipped =
            ran_any_turn && all_skipped && !execution.was_interrupted && !execution.was_paused;
        execution
    }

    fn interrupted(&self) -> bool {
        self.last_user_message_time
            .lock()
            .get(&self.room_id)
            .is_some_and(|t| *t > self.handling_started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn agent(id: i64, priority: i64) -> AgentRecord {
        AgentRecord {
            id,
            name: format!("agent-{id}"),
            world_name: None,
            group: None,
            config_file: None,
            profile_pic: None,
            in_a_nutshell: None,
            characteristics: None,
            recent_events: None,
            system_prompt: "prompt".into(),
            priority,
            interrupt_every_turn: false,
            transparent: false,
            created_at: Utc::now(),
        }
    }

    fn ids(tape: &Tape) -> Vec<i64> {
        tape.turns.iter().map(|t| t.agent_id).collect()
    }

    #[test]
    fn initial_round_orders_by_priority_then_insertion() {
        let generator = TapeGenerator::new(
            vec![agent(1, 0), agent(2, 5), agent(3, 0), agent(4, 5)],
            vec![],
        );
        let tape = generator.generate_initial_round();
        assert_eq!(ids(&tape), vec![2, 4, 1, 3]);
        assert!(tape.turns.iter().all(|t| !t.is_follow_up_round));
        assert!(tape.turns.iter().all(|t| t.round_index == 0));
    }

    #[test]
    fn follow_up_round_filters_to_eligible() {
        let generator = TapeGenerator::new(
            vec![agent(1, 0), agent(2, 5), agent(3, 0)],
            vec![],
        );
        let tape = generator.generate_follow_up_round(1, &[1, 2]);
        assert_eq!(ids(&tape), vec![2, 1]);
        assert!(tape.turns.iter().all(|t| t.is_follow_up_round));
        assert!(tape.turns.iter().all(|t| t.round_index == 1));
    }

    #[test]
    fn interrupt_agents_always_scheduled() {
        let generator = TapeGenerator::new(
            vec![agent(1, 0), agent(2, 0), agent(3, 9)],
            vec![3],
        );
        let tape = generator.generate_follow_up_round(2, &[]);
        assert_eq!(ids(&tape), vec![3]);
    }

    #[test]
    fn empty_eligibility_without_interrupters_is_empty_tape() {
        let generator = TapeGenerator::new(vec![agent(1, 0), agent(2, 0)], vec![]);
        let tape = generator.generate_follow_up_round(1, &[]);
        assert!(tape.turns.is_empty());
    }
}
