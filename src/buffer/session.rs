//! Client session identity.
//!
//! A session lives for a fixed validity window. The embedding application
//! persists [`Session::to_stored`] wherever it keeps client state and hands it
//! back through [`Session::restore`] on the next start.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            created_at: now,
        }
    }

    /// Restore a persisted session, regenerating it when missing, malformed,
    /// or older than `ttl`.
    pub fn restore(stored: Option<&str>, now: DateTime<Utc>, ttl: Duration) -> Self {
        let Some(raw) = stored else {
            return Self::new(now);
        };
        match serde_json::from_str::<Session>(raw) {
            Ok(session) if !session.is_expired(now, ttl) => session,
            Ok(_) => {
                debug!("stored session expired, regenerating");
                Self::new(now)
            }
            Err(e) => {
                debug!(error = %e, "stored session malformed, regenerating");
                Self::new(now)
            }
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at > ttl || self.created_at > now
    }

    /// Current session id, rotating the session first if it has expired.
    pub fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) -> Uuid {
        if self.is_expired(now, ttl) {
            *self = Self::new(now);
        }
        self.session_id
    }

    pub fn to_stored(&self) -> String {
        // Serializing a uuid and a timestamp cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::hours(24)
    }

    #[test]
    fn test_restore_round_trips_fresh_session() {
        let now = Utc::now();
        let session = Session::new(now - Duration::hours(1));
        let restored = Session::restore(Some(&session.to_stored()), now, ttl());
        assert_eq!(restored, session);
    }

    #[test]
    fn test_restore_regenerates_expired() {
        let now = Utc::now();
        let old = Session::new(now - Duration::hours(25));
        let restored = Session::restore(Some(&old.to_stored()), now, ttl());
        assert_ne!(restored.session_id, old.session_id);
        assert_eq!(restored.created_at, now);
    }

    #[test]
    fn test_restore_regenerates_malformed() {
        let now = Utc::now();
        let restored = Session::restore(Some("{not json"), now, ttl());
        assert_eq!(restored.created_at, now);
        let restored = Session::restore(Some(r#"{"session_id":"nope"}"#), now, ttl());
        assert_eq!(restored.created_at, now);
    }

    #[test]
    fn test_refresh_rotates_after_ttl() {
        let start = Utc::now();
        let mut session = Session::new(start);
        let first = session.refresh(start + Duration::hours(23), ttl());
        let second = session.refresh(start + Duration::hours(25), ttl());
        assert_ne!(first, second);
    }
}
