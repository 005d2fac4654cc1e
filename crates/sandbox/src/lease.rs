//! `SandboxLease` state machine.
//!
//! The only API that mutates lease state is [`LeaseStore::apply`]. Per-lease
//! serialization is a plain `tokio::sync::Mutex` keyed by `lease_id`, which
//! resolves the reentrant-locking question without a recursive-async-mutex
//! dependency: `apply` acquires the guard and delegates to `apply_locked`;
//! `ensure_active_instance`'s recovery branch acquires the guard itself and
//! calls `apply_locked` directly, never the public `apply`, so there is no
//! recursive acquire.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use sbx_domain::error::{Error, Result};
use sbx_domain::lifecycle::{assert_lease_observed_transition, LeaseObservedState};
use sbx_domain::trace::TraceEvent;
use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex as AsyncMutex;

use crate::provider::SandboxProvider;

/// A fully materialized lease snapshot, decoupled from the storage row type
/// so callers above this crate don't need `sbx-storage` in scope.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub provider_name: String,
    pub current_instance_id: Option<String>,
    pub desired_state: String,
    pub observed_state: LeaseObservedState,
    pub version: i64,
    pub observed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub needs_refresh: bool,
}

impl Lease {
    fn from_row(row: &sbx_storage::leases::LeaseRow) -> Self {
        Self {
            lease_id: row.lease_id.clone(),
            provider_name: row.provider_name.clone(),
            current_instance_id: row.current_instance_id.clone(),
            desired_state: row.desired_state.clone(),
            observed_state: LeaseObservedState::parse_lenient(Some(&row.observed_state)),
            version: row.version,
            observed_at: row.observed_at,
            last_error: row.last_error.clone(),
            needs_refresh: row.needs_refresh,
        }
    }
}

/// The event family `apply` accepts.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    IntentEnsureRunning,
    IntentPause,
    IntentResume,
    IntentDestroy,
    ObserveStatus { status: LeaseObservedState, raw_event_type: Option<String> },
    ProviderError { message: String },
}

impl LeaseEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::IntentEnsureRunning => "intent.ensure_running",
            Self::IntentPause => "intent.pause",
            Self::IntentResume => "intent.resume",
            Self::IntentDestroy => "intent.destroy",
            Self::ObserveStatus { .. } => "observe.status",
            Self::ProviderError { .. } => "provider.error",
        }
    }
}

pub struct LeaseStore {
    pool: SqlitePool,
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    freshness_ttl: chrono::Duration,
}

impl LeaseStore {
    pub fn new(pool: SqlitePool, freshness_ttl_sec: i64) -> Self {
        Self {
            pool,
            locks: SyncMutex::new(HashMap::new()),
            freshness_ttl: chrono::Duration::seconds(freshness_ttl_sec),
        }
    }

    fn lock_for(&self, lease_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(lease_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn get(&self, lease_id: &str) -> Result<Option<Lease>> {
        Ok(sbx_storage::leases::get(&self.pool, lease_id)
            .await?
            .as_ref()
            .map(Lease::from_row))
    }

    pub async fn create(&self, lease_id: &str, provider_name: &str) -> Result<Lease> {
        let row = sbx_storage::leases::create(&self.pool, lease_id, provider_name, "running", "detached").await?;
        Ok(Lease::from_row(&row))
    }

    /// Public entry point: acquires the per-lease lock then delegates to
    /// [`Self::apply_locked`].
    pub async fn apply(
        &self,
        lease_id: &str,
        provider: &dyn SandboxProvider,
        event: LeaseEvent,
        source: &str,
    ) -> Result<Lease> {
        let lock = self.lock_for(lease_id);
        let _guard = lock.lock().await;
        self.apply_locked(lease_id, provider, event, source).await
    }

    /// Assumes the per-lease guard is already held by the caller. Never call
    /// this without holding `self.lock_for(lease_id)`.
    pub async fn apply_locked(
        &self,
        lease_id: &str,
        provider: &dyn SandboxProvider,
        event: LeaseEvent,
        source: &str,
    ) -> Result<Lease> {
        let current = sbx_storage::leases::get(&self.pool, lease_id)
            .await?
            .ok_or_else(|| Error::SchemaInconsistency(format!("lease {lease_id} not found")))?;
        let current_observed = LeaseObservedState::parse_lenient(Some(&current.observed_state));
        let event_type = event.event_type();
        let event_id = uuid::Uuid::new_v4().to_string();

        let outcome = self.apply_inner(&current, provider, &event).await;

        match outcome {
            Ok((new_instance_id, new_observed, needs_refresh_clear)) => {
                assert_lease_observed_transition(current_observed, new_observed, event_type)?;
                let new_version = current.version + 1;
                let now = Utc::now();

                sbx_storage::leases::update_snapshot(
                    &self.pool,
                    lease_id,
                    new_instance_id.as_deref().or(current.current_instance_id.as_deref()),
                    &current.desired_state,
                    &new_observed.to_string(),
                    new_version,
                    Some(now),
                    None,
                    !needs_refresh_clear && current.needs_refresh,
                    current.refresh_hint_at,
                )
                .await?;

                let payload = serde_json::json!({ "event": event_type, "source": source }).to_string();
                sbx_storage::leases::append_event(
                    &self.pool, &event_id, lease_id, event_type, source, &payload, None,
                )
                .await?;

                TraceEvent::LeaseApply {
                    lease_id: lease_id.to_string(),
                    event_type: event_type.to_string(),
                    from_state: current_observed.to_string(),
                    to_state: new_observed.to_string(),
                    ok: true,
                }
                .emit();

                if let Some(new_id) = &new_instance_id {
                    if current.current_instance_id.as_deref() != Some(new_id.as_str()) {
                        TraceEvent::LeaseInstanceRebound {
                            lease_id: lease_id.to_string(),
                            old_instance_id: current.current_instance_id.clone(),
                            new_instance_id: new_id.clone(),
                        }
                        .emit();
                    }
                }

                self.get(lease_id).await?.ok_or_else(|| Error::Other("lease vanished".into()))
            }
            Err(err) => {
                let message = truncate(&err.to_string(), 2000);
                sbx_storage::leases::update_snapshot(
                    &self.pool,
                    lease_id,
                    current.current_instance_id.as_deref(),
                    &current.desired_state,
                    &current.observed_state,
                    current.version,
                    current.observed_at,
                    Some(&message),
                    true,
                    None,
                )
                .await?;

                let payload = serde_json::json!({ "event": event_type, "source": source }).to_string();
                sbx_storage::leases::append_event(
                    &self.pool, &event_id, lease_id, event_type, source, &payload, Some(&message),
                )
                .await?;

                TraceEvent::LeaseApply {
                    lease_id: lease_id.to_string(),
                    event_type: event_type.to_string(),
                    from_state: current_observed.to_string(),
                    to_state: current_observed.to_string(),
                    ok: false,
                }
                .emit();

                Err(err)
            }
        }
    }

    /// Calls into the provider (step 4 of `apply` algorithm) and
    /// returns `(maybe_new_instance_id, new_observed_state, clears_needs_refresh)`.
    async fn apply_inner(
        &self,
        current: &sbx_storage::leases::LeaseRow,
        provider: &dyn SandboxProvider,
        event: &LeaseEvent,
    ) -> Result<(Option<String>, LeaseObservedState, bool)> {
        let cap = provider.capability();
        match event {
            LeaseEvent::IntentEnsureRunning => {
                if let Some(instance_id) = &current.current_instance_id {
                    if cap.supports_status_probe {
                        let raw = provider.get_session_status(instance_id).await?;
                        return Ok((None, LeaseObservedState::parse_lenient(Some(&raw)), true));
                    }
                    return Ok((None, LeaseObservedState::Running, true));
                }
                let session = provider.create_session(None).await?;
                Ok((Some(session.session_id), LeaseObservedState::Running, true))
            }
            LeaseEvent::IntentPause => {
                if !cap.can_pause {
                    return Err(Error::CapabilityUnsupported {
                        provider: provider.name().to_string(),
                        capability: "pause".into(),
                    });
                }
                let instance_id = current.current_instance_id.clone().ok_or_else(|| {
                    Error::SchemaInconsistency("pause requested with no bound instance".into())
                })?;
                provider.pause_session(&instance_id).await?;
                Ok((None, LeaseObservedState::Paused, true))
            }
            LeaseEvent::IntentResume => {
                if !cap.can_resume {
                    return Err(Error::CapabilityUnsupported {
                        provider: provider.name().to_string(),
                        capability: "resume".into(),
                    });
                }
                let instance_id = current.current_instance_id.clone().ok_or_else(|| {
                    Error::SchemaInconsistency("resume requested with no bound instance".into())
                })?;
                provider.resume_session(&instance_id).await?;
                Ok((None, LeaseObservedState::Running, true))
            }
            LeaseEvent::IntentDestroy => {
                if let Some(instance_id) = &current.current_instance_id {
                    if cap.can_destroy {
                        provider.destroy_session(instance_id).await?;
                    }
                }
                Ok((None, LeaseObservedState::Detached, true))
            }
            LeaseEvent::ObserveStatus { status, .. } => Ok((None, *status, *status != LeaseObservedState::Unknown)),
            LeaseEvent::ProviderError { message } => {
                Err(Error::ProviderInfra { provider: provider.name().to_string(), message: message.clone() })
            }
        }
    }

    /// Three-tier recovery algorithm: fast-path freshness check, then a
    /// lockless probe, then a locked create-or-rebind.
    pub async fn ensure_active_instance(&self, lease_id: &str, provider: &dyn SandboxProvider) -> Result<Lease> {
        // Tier 1: fast path, no lock.
        if let Some(lease) = self.get(lease_id).await? {
            let fresh = lease
                .observed_at
                .map(|at| Utc::now() - at <= self.freshness_ttl)
                .unwrap_or(false);
            if lease.current_instance_id.is_some()
                && lease.observed_state == LeaseObservedState::Running
                && fresh
                && !lease.needs_refresh
            {
                return Ok(lease);
            }
        }

        // Tier 2: probe without lock, if the provider supports it and an
        // instance is already bound. This is an observation, not an intent —
        // it records as `observe.status` in the lease_events audit trail,
        // same as a webhook-driven update.
        let cap = provider.capability();
        if cap.supports_status_probe {
            if let Some(instance_id) = self.get(lease_id).await?.and_then(|l| l.current_instance_id) {
                let raw = provider.get_session_status(&instance_id).await?;
                let status = LeaseObservedState::parse_lenient(Some(&raw));
                let probed = self
                    .apply(
                        lease_id,
                        provider,
                        LeaseEvent::ObserveStatus { status, raw_event_type: None },
                        "ensure_active_instance",
                    )
                    .await?;
                if probed.observed_state == LeaseObservedState::Paused {
                    return Err(Error::LeasePaused { lease_id: lease_id.to_string() });
                }
                if probed.observed_state == LeaseObservedState::Running {
                    return Ok(probed);
                }
            }
        }

        // Tier 3: lock, re-check, create-or-rebind if still detached.
        let lock = self.lock_for(lease_id);
        let _guard = lock.lock().await;
        let current = self.get(lease_id).await?.ok_or_else(|| {
            Error::SchemaInconsistency(format!("lease {lease_id} not found"))
        })?;
        if current.observed_state == LeaseObservedState::Running && current.current_instance_id.is_some() {
            return Ok(current);
        }
        if current.observed_state == LeaseObservedState::Paused {
            return Err(Error::LeasePaused { lease_id: lease_id.to_string() });
        }

        self.apply_locked(lease_id, provider, LeaseEvent::IntentEnsureRunning, "ensure_active_instance")
            .await
    }

    /// Flags a lease as needing a refresh without going through `apply` —
    /// used for webhook events that classify as `Unknown`, which leave the
    /// observed state unchanged but should still invalidate the freshness
    /// window rather than drive an observed-state transition.
    pub async fn mark_needs_refresh(&self, lease_id: &str) -> Result<()> {
        let current = sbx_storage::leases::get(&self.pool, lease_id)
            .await?
            .ok_or_else(|| Error::SchemaInconsistency(format!("lease {lease_id} not found")))?;
        sbx_storage::leases::update_snapshot(
            &self.pool,
            lease_id,
            current.current_instance_id.as_deref(),
            &current.desired_state,
            &current.observed_state,
            current.version,
            current.observed_at,
            current.last_error.as_deref(),
            true,
            current.refresh_hint_at,
        )
        .await
    }

    pub async fn list_events(&self, lease_id: &str) -> Result<Vec<sbx_storage::leases::LeaseEventRow>> {
        sbx_storage::leases::list_events_for_lease(&self.pool, lease_id).await
    }

    pub async fn delete(&self, lease_id: &str) -> Result<()> {
        sbx_storage::leases::delete_instances_for_lease(&self.pool, lease_id).await?;
        sbx_storage::leases::delete(&self.pool, lease_id).await
    }

    pub async fn is_referenced(&self, lease_id: &str) -> Result<bool> {
        sbx_storage::leases::is_referenced_by_any_terminal(&self.pool, lease_id).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::FakeProvider;

    async fn store() -> LeaseStore {
        let pool = sbx_storage::open_in_memory().await.unwrap();
        LeaseStore::new(pool, 3)
    }

    #[tokio::test]
    async fn ensure_active_instance_creates_once() {
        let store = store().await;
        store.create("lease-1", "fake").await.unwrap();
        let provider = FakeProvider::new("fake");

        let a = store.ensure_active_instance("lease-1", &provider).await.unwrap();
        let b = store.ensure_active_instance("lease-1", &provider).await.unwrap();

        assert_eq!(a.current_instance_id, b.current_instance_id);
        assert_eq!(provider.create_calls(), 1);
    }

    #[tokio::test]
    async fn pause_without_capability_is_unsupported() {
        let store = store().await;
        store.create("lease-1", "fake").await.unwrap();
        let provider = FakeProvider::new("fake").without_pause();
        store.ensure_active_instance("lease-1", &provider).await.unwrap();

        let err = store
            .apply(
                "lease-1",
                &provider,
                LeaseEvent::IntentPause,
                "test",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityUnsupported { .. }));
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips() {
        let store = store().await;
        store.create("lease-1", "fake").await.unwrap();
        let provider = FakeProvider::new("fake");
        store.ensure_active_instance("lease-1", &provider).await.unwrap();

        let paused = store.apply("lease-1", &provider, LeaseEvent::IntentPause, "test").await.unwrap();
        assert_eq!(paused.observed_state, LeaseObservedState::Paused);

        let err = store.ensure_active_instance("lease-1", &provider).await.unwrap_err();
        assert!(matches!(err, Error::LeasePaused { .. }));

        let resumed = store.apply("lease-1", &provider, LeaseEvent::IntentResume, "test").await.unwrap();
        assert_eq!(resumed.observed_state, LeaseObservedState::Running);
    }

    #[tokio::test]
    async fn illegal_observed_transition_is_rejected() {
        let store = store().await;
        store.create("lease-1", "fake").await.unwrap();
        let provider = FakeProvider::new("fake");

        // detached -> paused is not a legal edge.
        let err = store
            .apply(
                "lease-1",
                &provider,
                LeaseEvent::ObserveStatus { status: LeaseObservedState::Paused, raw_event_type: None },
                "webhook",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn ensure_active_instance_tier2_probe_records_observe_status() {
        let store = store().await;
        store.create("lease-1", "fake").await.unwrap();
        let provider = FakeProvider::new("fake").with_status_probe();

        store.ensure_active_instance("lease-1", &provider).await.unwrap();
        // Force Tier 1's freshness fast path to miss so Tier 2's lockless
        // probe actually runs.
        store.mark_needs_refresh("lease-1").await.unwrap();

        let lease = store.ensure_active_instance("lease-1", &provider).await.unwrap();
        assert_eq!(lease.observed_state, LeaseObservedState::Running);

        let events = store.list_events("lease-1").await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, "observe.status");
    }

    #[tokio::test]
    async fn version_monotone_on_every_apply() {
        let store = store().await;
        store.create("lease-1", "fake").await.unwrap();
        let provider = FakeProvider::new("fake");

        let a = store.ensure_active_instance("lease-1", &provider).await.unwrap();
        let b = store.apply("lease-1", &provider, LeaseEvent::IntentPause, "test").await.unwrap();
        assert!(b.version > a.version);
    }
}
