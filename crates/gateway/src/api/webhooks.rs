//! Provider webhook intake: `POST /webhooks/:provider_name` and the
//! companion `GET /webhooks/events` audit log.
//!
//! Auth here is HMAC, not the bearer-token middleware — a provider can't be
//! handed our API token, so this route lives in the public router and
//! verifies its own signature when a secret is configured for the provider.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::reconcile;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Verifies `X-Signature: <base64url-no-pad HMAC-SHA256 of the raw body>`.
/// Providers without a configured secret skip verification entirely —
/// signing is opt-in per provider.
fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let computed = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    computed.as_bytes().ct_eq(header_value.as_bytes()).unwrap_u8() == 1
}

/// `POST /webhooks/:provider_name`
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = state.config.webhooks.secrets.get(&provider_name) {
        let sig = headers.get("x-signature").and_then(|v| v.to_str().ok()).unwrap_or("");
        if sig.is_empty() || !verify_signature(secret, &body, sig) {
            return api_error(StatusCode::UNAUTHORIZED, "invalid webhook signature");
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")),
    };

    let Some(instance_id) = reconcile::extract_instance_id(&payload) else {
        return api_error(StatusCode::BAD_REQUEST, "payload has no recognizable session/instance id field");
    };
    let raw_event_type = reconcile::extract_raw_event_type(&payload).unwrap_or_else(|| "unknown".to_string());
    let observed = reconcile::classify_event_type(&raw_event_type);

    let lease = sbx_storage::leases::find_by_current_instance_id(&state.pool, &provider_name, &instance_id)
        .await
        .ok()
        .flatten();
    let matched_lease_id = lease.as_ref().map(|l| l.lease_id.clone());

    let payload_json = serde_json::to_string(&payload).unwrap_or_default();
    let _ = sbx_storage::provider_events::append(
        &state.pool,
        &provider_name,
        &instance_id,
        &raw_event_type,
        &payload_json,
        matched_lease_id.as_deref(),
    )
    .await;

    sbx_domain::trace::TraceEvent::WebhookReceived {
        provider_name: provider_name.clone(),
        instance_id: instance_id.clone(),
        event_type: raw_event_type.clone(),
        matched: matched_lease_id.is_some(),
    }
    .emit();

    if let Some(lease) = &lease {
        if observed == sbx_domain::lifecycle::LeaseObservedState::Unknown {
            // Unrecognized event types don't drive a transition — they only
            // invalidate the freshness TTL so the next use re-probes.
            if let Err(e) = state.sandbox.lease_store().mark_needs_refresh(&lease.lease_id).await {
                tracing::warn!(lease_id = %lease.lease_id, error = %e, "webhook: failed to mark needs_refresh");
            }
        } else if let Some(provider) = state.sandbox.registry().get(&provider_name) {
            let event = sbx_sandbox::lease::LeaseEvent::ObserveStatus {
                status: observed,
                raw_event_type: Some(raw_event_type.clone()),
            };
            if let Err(e) =
                state.sandbox.lease_store().apply(&lease.lease_id, provider.as_ref(), event, "webhook").await
            {
                tracing::warn!(lease_id = %lease.lease_id, error = %e, "webhook: failed to apply observed status");
            }
        }
    }

    Json(serde_json::json!({
        "ok": true,
        "provider": provider_name,
        "instance_id": instance_id,
        "event_type": raw_event_type,
        "matched": matched_lease_id.is_some(),
        "lease_id": matched_lease_id,
    }))
    .into_response()
}

#[derive(serde::Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// `GET /webhooks/events?limit=N`
pub async fn list_events(State(state): State<AppState>, Query(query): Query<EventsQuery>) -> impl IntoResponse {
    let limit = query.limit.clamp(1, 1000);
    match sbx_storage::provider_events::list_recent(&state.pool, limit).await {
        Ok(rows) => {
            let events: Vec<_> = rows
                .into_iter()
                .map(|r| {
                    serde_json::json!({
                        "event_id": r.event_id,
                        "provider_name": r.provider_name,
                        "instance_id": r.instance_id,
                        "event_type": r.event_type,
                        "matched_lease_id": r.matched_lease_id,
                        "created_at": r.created_at,
                    })
                })
                .collect();
            Json(serde_json::json!({ "events": events })).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrips() {
        let secret = "s3cr3t";
        let body = b"{\"hello\":\"world\"}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        assert!(verify_signature(secret, body, &sig));
        assert!(!verify_signature(secret, body, "not-the-signature"));
    }
}
