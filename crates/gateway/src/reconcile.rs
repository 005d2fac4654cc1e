//! Provider event intake (C7): webhook field-name leniency, provider
//! status-string classification, and the periodic sweep that refreshes
//! leases a webhook never reached.
//!
//! Providers spell the same fields differently (`sessionId`, `session_id`,
//! `sessionID`, ...) and bury them under a `data` wrapper or not depending
//! on the event. Rather than special-case each provider, every lookup here
//! tries every known spelling at both the top level and under `data`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sbx_domain::lifecycle::LeaseObservedState;

use crate::state::AppState;

const ID_FIELDS: &[&str] =
    &["session_id", "sessionId", "sessionID", "sandbox_id", "sandboxId", "instance_id", "instanceId", "id"];

const EVENT_TYPE_FIELDS: &[&str] = &["event", "event_type", "eventType", "type", "status"];

fn lookup_first(payload: &serde_json::Value, fields: &[&str]) -> Option<String> {
    for field in fields {
        if let Some(v) = payload.get(field).and_then(|v| v.as_str()) {
            return Some(v.to_string());
        }
    }
    if let Some(data) = payload.get("data") {
        for field in fields {
            if let Some(v) = data.get(field).and_then(|v| v.as_str()) {
                return Some(v.to_string());
            }
        }
    }
    None
}

pub fn extract_instance_id(payload: &serde_json::Value) -> Option<String> {
    lookup_first(payload, ID_FIELDS)
}

pub fn extract_raw_event_type(payload: &serde_json::Value) -> Option<String> {
    lookup_first(payload, EVENT_TYPE_FIELDS)
}

/// Maps a provider's free-text event/status string onto the canonical
/// observed-state vocabulary. Unrecognized
/// strings classify as `Unknown` rather than erroring — an unrecognized
/// event still gets recorded in `provider_events`, it just can't drive a
/// lease transition.
pub fn classify_event_type(raw: &str) -> LeaseObservedState {
    let lower = raw.to_lowercase();
    if lower.contains("pause") {
        LeaseObservedState::Paused
    } else if lower.contains("resume") || lower.contains("start") || lower.contains("running") {
        LeaseObservedState::Running
    } else if lower.contains("destroy") || lower.contains("delete") || lower.contains("stop") || lower.contains("kill")
    {
        LeaseObservedState::Detached
    } else {
        LeaseObservedState::Unknown
    }
}

/// Refreshes every lease flagged `needs_refresh` whose `refresh_hint_at`
/// is older than `stale_after` — the safety net for instances whose
/// webhook never arrived or was dropped. Each refresh goes through
/// `ensure_active_instance`, so it reuses the same freshness-TTL and
/// rebind logic a live command would.
pub async fn sweep_stale_leases(state: Arc<AppState>, stale_after: chrono::Duration) -> usize {
    let cutoff = Utc::now() - stale_after;
    let Ok(stale) = sbx_storage::leases::list_needing_refresh(&state.pool, cutoff).await else {
        tracing::warn!("reconcile sweep: failed to list leases needing refresh");
        return 0;
    };

    let mut refreshed = 0;
    for lease_row in stale {
        let Some(provider) = state.sandbox.registry().get(&lease_row.provider_name) else {
            tracing::warn!(provider = %lease_row.provider_name, lease_id = %lease_row.lease_id, "reconcile: unknown provider");
            continue;
        };
        match state.sandbox.lease_store().ensure_active_instance(&lease_row.lease_id, provider.as_ref()).await {
            Ok(_) => refreshed += 1,
            Err(e) => tracing::warn!(lease_id = %lease_row.lease_id, error = %e, "reconcile: refresh failed"),
        }
    }
    refreshed
}

pub fn spawn_reconcile_loop(state: Arc<AppState>, interval: Duration, stale_after_sec: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let n = sweep_stale_leases(state.clone(), chrono::Duration::seconds(stale_after_sec)).await;
            if n > 0 {
                tracing::info!(refreshed = n, "reconcile sweep refreshed stale leases");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_id_from_camel_case_field() {
        let payload = serde_json::json!({ "sessionId": "abc-123" });
        assert_eq!(extract_instance_id(&payload).as_deref(), Some("abc-123"));
    }

    #[test]
    fn extracts_id_nested_under_data() {
        let payload = serde_json::json!({ "data": { "sandbox_id": "sb-1" } });
        assert_eq!(extract_instance_id(&payload).as_deref(), Some("sb-1"));
    }

    #[test]
    fn missing_id_returns_none() {
        let payload = serde_json::json!({ "unrelated": true });
        assert!(extract_instance_id(&payload).is_none());
    }

    #[test]
    fn classifies_pause_variants() {
        assert_eq!(classify_event_type("sandbox.paused"), LeaseObservedState::Paused);
        assert_eq!(classify_event_type("PAUSE_COMPLETE"), LeaseObservedState::Paused);
    }

    #[test]
    fn classifies_destroy_variants() {
        assert_eq!(classify_event_type("instance.destroyed"), LeaseObservedState::Detached);
        assert_eq!(classify_event_type("session.killed"), LeaseObservedState::Detached);
    }

    #[test]
    fn classifies_running_variants() {
        assert_eq!(classify_event_type("sandbox.running"), LeaseObservedState::Running);
        assert_eq!(classify_event_type("resume_ok"), LeaseObservedState::Running);
    }

    #[test]
    fn unrecognized_event_is_unknown() {
        assert_eq!(classify_event_type("heartbeat"), LeaseObservedState::Unknown);
    }
}
