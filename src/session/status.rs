//! Session status types.
//!
//! `SessionStatus` is a closed enum with transition legality centralized in
//! `can_advance_to`, so monotonicity is checked in one place instead of
//! scattered conditionals.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a meeting session.
///
/// States advance strictly forward; `Failed` is reachable from every
/// non-terminal state and never leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Joining,
    Active,
    Ended,
    TranscriptReady,
    Delivering,
    Delivered,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::TranscriptReady => "transcript_ready",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "joining" => Some(Self::Joining),
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            "transcript_ready" => Some(Self::TranscriptReady),
            "delivering" => Some(Self::Delivering),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Position along the forward path. `Failed` has no rank.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Joining => Some(1),
            Self::Active => Some(2),
            Self::Ended => Some(3),
            Self::TranscriptReady => Some(4),
            Self::Delivering => Some(5),
            Self::Delivered => Some(6),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether the meeting has been observed to end. The transcript is
    /// populated only at or past this point.
    pub fn has_ended(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::TranscriptReady | Self::Delivering | Self::Delivered
        )
    }

    /// Single source of truth for legal transitions: one step forward
    /// along the path, or into `Failed` from any non-terminal state.
    pub fn can_advance_to(&self, next: SessionStatus) -> bool {
        if next == Self::Failed {
            return !self.is_terminal();
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to == from + 1,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Webhook delivery state, tracked separately from the lifecycle so a
/// delivery-exhausted failure is distinguishable from a join failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Exhausted,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "exhausted" => Some(Self::Exhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORWARD_PATH: [SessionStatus; 7] = [
        SessionStatus::Created,
        SessionStatus::Joining,
        SessionStatus::Active,
        SessionStatus::Ended,
        SessionStatus::TranscriptReady,
        SessionStatus::Delivering,
        SessionStatus::Delivered,
    ];

    #[test]
    fn test_forward_path_is_legal_and_monotonic() {
        for pair in FORWARD_PATH.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(pair[0].rank().unwrap() < pair[1].rank().unwrap());
        }
    }

    #[test]
    fn test_no_skipping_or_regressing() {
        assert!(!SessionStatus::Created.can_advance_to(SessionStatus::Active));
        assert!(!SessionStatus::Joining.can_advance_to(SessionStatus::Ended));
        assert!(!SessionStatus::Active.can_advance_to(SessionStatus::Joining));
        assert!(!SessionStatus::Delivered.can_advance_to(SessionStatus::Created));
        assert!(!SessionStatus::Ended.can_advance_to(SessionStatus::Ended));
    }

    #[test]
    fn test_failed_reachable_from_all_non_terminal_states() {
        for status in FORWARD_PATH.iter().take(6) {
            assert!(status.can_advance_to(SessionStatus::Failed), "{status}");
        }
    }

    #[test]
    fn test_failed_is_a_sink() {
        assert!(!SessionStatus::Failed.can_advance_to(SessionStatus::Failed));
        assert!(!SessionStatus::Delivered.can_advance_to(SessionStatus::Failed));
        for status in FORWARD_PATH {
            assert!(!SessionStatus::Failed.can_advance_to(status));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionStatus::Delivered.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        for status in FORWARD_PATH.iter().take(6) {
            assert!(!status.is_terminal(), "{status}");
        }
    }

    #[test]
    fn test_has_ended() {
        assert!(!SessionStatus::Created.has_ended());
        assert!(!SessionStatus::Joining.has_ended());
        assert!(!SessionStatus::Active.has_ended());
        assert!(SessionStatus::Ended.has_ended());
        assert!(SessionStatus::TranscriptReady.has_ended());
        assert!(SessionStatus::Delivering.has_ended());
        assert!(SessionStatus::Delivered.has_ended());
    }

    #[test]
    fn test_as_str_parse_round_trip() {
        for status in FORWARD_PATH.into_iter().chain([SessionStatus::Failed]) {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_serde_representation() {
        let json = serde_json::to_string(&SessionStatus::TranscriptReady).unwrap();
        assert_eq!(json, "\"transcript_ready\"");

        let parsed: SessionStatus = serde_json::from_str("\"delivering\"").unwrap();
        assert_eq!(parsed, SessionStatus::Delivering);
    }

    #[test]
    fn test_delivery_status_round_trip() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Delivered,
            DeliveryStatus::Exhausted,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("gone"), None);
    }
}
