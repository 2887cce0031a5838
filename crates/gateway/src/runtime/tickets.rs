//! Single-use tickets for SSE authentication.
//!
//! A browser `EventSource` cannot set custom headers, so the client
//! first POSTs (with its normal token) for a short-lived ticket, then
//! passes it as a query parameter on the stream GET. Tickets are
//! consumed on first validation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;

use ag_domain::types::UserRole;

const TICKET_TTL: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Identity bound to a ticket at creation time.
#[derive(Debug, Clone)]
pub struct TicketData {
    pub user_id: String,
    pub role: UserRole,
    pub room_id: i64,
    created_at: Instant,
}

pub struct SseTicketManager {
    tickets: Mutex<HashMap<String, TicketData>>,
    last_cleanup: Mutex<Instant>,
    ttl: Duration,
}

impl Default for SseTicketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SseTicketManager {
    pub fn new() -> Self {
        Self::with_ttl(TICKET_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
            ttl,
        }
    }

    /// Mint a single-use ticket bound to (user, role, room).
    pub fn create_ticket(&self, user_id: &str, role: UserRole, room_id: i64) -> String {
        self.maybe_cleanup();
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let ticket = hex::encode(bytes);
        self.tickets.lock().insert(
            ticket.clone(),
            TicketData {
                user_id: user_id.to_owned(),
                role,
                room_id,
                created_at: Instant::now(),
            },
        );
        tracing::debug!(user_id, room_id, "SSE ticket created");
        ticket
    }

    /// Validate and consume a ticket. Returns `None` for unknown,
    /// expired, or wrong-room tickets; a second call with the same
    /// ticket always returns `None`.
    pub fn validate_ticket(&self, ticket: &str, room_id: i64) -> Option<TicketData> {
        self.maybe_cleanup();
        let data = self.tickets.lock().remove(ticket)?;

        if data.created_at.elapsed() > self.ttl {
            tracing::debug!("SSE ticket expired");
            return None;
        }
        if data.room_id != room_id {
            tracing::warn!(
                ticket_room = data.room_id,
                request_room = room_id,
                "SSE ticket room mismatch"
            );
            return None;
        }
        Some(data)
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.lock().len()
    }

    fn maybe_cleanup(&self) {
        {
            let mut last = self.last_cleanup.lock();
            if last.elapsed() < CLEANUP_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        let ttl = self.ttl;
        let mut tickets = self.tickets.lock();
        let before = tickets.len();
        tickets.retain(|_, data| data.created_at.elapsed() <= ttl);
        let removed = before - tickets.len();
        if removed > 0 {
            tracing::debug!(removed, "cleaned up expired SSE tickets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_round_trip() {
        let manager = SseTicketManager::new();
        let ticket = manager.create_ticket("admin", UserRole::Admin, 1);

        let data = manager.validate_ticket(&ticket, 1).unwrap();
        assert_eq!(data.user_id, "admin");
        assert_eq!(data.role, UserRole::Admin);
        assert_eq!(data.room_id, 1);
    }

    #[test]
    fn ticket_is_single_use() {
        let manager = SseTicketManager::new();
        let ticket = manager.create_ticket("admin", UserRole::Admin, 1);

        assert!(manager.validate_ticket(&ticket, 1).is_some());
        assert!(manager.validate_ticket(&ticket, 1).is_none());
    }

    #[test]
    fn room_mismatch_rejected_and_consumed() {
        let manager = SseTicketManager::new();
        let ticket = manager.create_ticket("admin", UserRole::Admin, 1);

        assert!(manager.validate_ticket(&ticket, 2).is_none());
        // Consumed by the failed attempt.
        assert!(manager.validate_ticket(&ticket, 1).is_none());
    }

    #[test]
    fn expired_ticket_rejected() {
        let manager = SseTicketManager::with_ttl(Duration::from_millis(5));
        let ticket = manager.create_ticket("admin", UserRole::Admin, 1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(manager.validate_ticket(&ticket, 1).is_none());
    }

    #[test]
    fn unknown_ticket_rejected() {
        let manager = SseTicketManager::new();
        assert!(manager.validate_ticket("bogus", 1).is_none());
    }

    #[test]
    fn tickets_are_unique_and_url_safe() {
        let manager = SseTicketManager::new();
        let a = manager.create_ticket("admin", UserRole::Admin, 1);
        let b = manager.create_ticket("admin", UserRole::Admin, 1);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
