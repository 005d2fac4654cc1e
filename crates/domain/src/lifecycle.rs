//! State machine contracts for chat sessions and lease instances.
//!
//! Fail-loud policy: an illegal transition is always a hard error (an
//! `IllegalTransition`), never a silent clamp.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSessionStatus {
    Active,
    Idle,
    Paused,
    Closed,
    Failed,
}

impl fmt::Display for ChatSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Paused => "paused",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl ChatSessionStatus {
    pub fn parse(value: &str) -> crate::error::Result<Self> {
        Ok(match value {
            "active" => Self::Active,
            "idle" => Self::Idle,
            "paused" => Self::Paused,
            "closed" => Self::Closed,
            "failed" => Self::Failed,
            other => {
                return Err(Error::SchemaInconsistency(format!(
                    "invalid chat session status: {other}"
                )))
            }
        })
    }
}

/// Legal edges: initial->active; active<->idle; active->paused;
/// paused->active; {active,idle,paused,failed}->closed; active->failed.
pub fn assert_chat_session_transition(
    current: Option<ChatSessionStatus>,
    target: ChatSessionStatus,
    reason: &str,
) -> crate::error::Result<()> {
    use ChatSessionStatus::*;

    let Some(current) = current else {
        return if target == Active {
            Ok(())
        } else {
            Err(Error::IllegalTransition {
                entity: "chat_session".into(),
                from: "<new>".into(),
                to: target.to_string(),
                reason: reason.into(),
            })
        };
    };

    if current == target {
        return Ok(());
    }

    let allowed = matches!(
        (current, target),
        (Active, Idle)
            | (Active, Paused)
            | (Active, Closed)
            | (Active, Failed)
            | (Idle, Active)
            | (Idle, Paused)
            | (Idle, Closed)
            | (Idle, Failed)
            | (Paused, Active)
            | (Paused, Closed)
            | (Paused, Failed)
            | (Failed, Closed)
    );

    if allowed {
        Ok(())
    } else {
        Err(Error::IllegalTransition {
            entity: "chat_session".into(),
            from: current.to_string(),
            to: target.to_string(),
            reason: reason.into(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseObservedState {
    Running,
    Paused,
    Detached,
    Unknown,
}

impl fmt::Display for LeaseObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Detached => "detached",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl LeaseObservedState {
    /// Normalizes a raw provider status string. Unrecognized strings that
    /// plausibly mean "gone" collapse to `Detached`; anything else
    /// unrecognized is an error — the caller decides whether that should
    /// become `Unknown` (see provider event mapping tables, which treat
    /// "anything else" as `Unknown` explicitly rather than erroring).
    pub fn parse_lenient(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::Detached;
        };
        match value.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "deleted" | "dead" | "stopped" | "detached" => Self::Detached,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseDesiredState {
    Running,
    Paused,
    Destroyed,
}

/// Legal edges: detached->{running,unknown}; running->{paused,detached,unknown};
/// paused->{running,detached,unknown}; unknown->{running,paused,detached}.
pub fn assert_lease_observed_transition(
    current: LeaseObservedState,
    target: LeaseObservedState,
    reason: &str,
) -> crate::error::Result<()> {
    use LeaseObservedState::*;

    if current == target {
        return Ok(());
    }

    let allowed = matches!(
        (current, target),
        (Detached, Running)
            | (Detached, Unknown)
            | (Running, Paused)
            | (Running, Detached)
            | (Running, Unknown)
            | (Paused, Running)
            | (Paused, Detached)
            | (Paused, Unknown)
            | (Unknown, Running)
            | (Unknown, Paused)
            | (Unknown, Detached)
    );

    if allowed {
        Ok(())
    } else {
        Err(Error::IllegalTransition {
            entity: "sandbox_lease".into(),
            from: current.to_string(),
            to: target.to_string(),
            reason: reason.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_must_start_active() {
        assert!(assert_chat_session_transition(None, ChatSessionStatus::Active, "create").is_ok());
        assert!(assert_chat_session_transition(None, ChatSessionStatus::Idle, "create").is_err());
    }

    #[test]
    fn closed_is_terminal() {
        assert!(assert_chat_session_transition(
            Some(ChatSessionStatus::Closed),
            ChatSessionStatus::Active,
            "reopen"
        )
        .is_err());
    }

    #[test]
    fn lease_detached_to_paused_is_illegal() {
        assert!(assert_lease_observed_transition(
            LeaseObservedState::Detached,
            LeaseObservedState::Paused,
            "bad"
        )
        .is_err());
    }

    #[test]
    fn lease_same_state_is_a_noop() {
        assert!(assert_lease_observed_transition(
            LeaseObservedState::Running,
            LeaseObservedState::Running,
            "idempotent observe"
        )
        .is_ok());
    }
}
