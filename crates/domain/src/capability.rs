use serde::{Deserialize, Serialize};

/// Declared lifecycle capability of a `SandboxProvider` implementation.
///
/// The lease and manager layers read this at every decision point instead
/// of branching on a concrete provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapability {
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_destroy: bool,
    pub supports_webhook: bool,
    pub supports_status_probe: bool,
    /// Whether `create_session` binds and returns a ready-to-use instance
    /// synchronously, vs. a provider that returns a handle before the
    /// instance has fully booted.
    pub eager_instance_binding: bool,
    /// Whether `list_provider_sessions` is meaningful for orphan discovery.
    pub inspect_visible: bool,
    pub runtime_kind: RuntimeKind,
}

/// Selects which `PhysicalTerminalRuntime` variant a provider is driven
/// through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    LocalShell,
    RemoteWrapped,
}

impl ProviderCapability {
    /// The `local` provider: a long-lived shell on this host. Never paused
    /// by the idle reaper — there is no remote instance to release.
    pub const fn local() -> Self {
        Self {
            can_pause: false,
            can_resume: false,
            can_destroy: true,
            supports_webhook: false,
            supports_status_probe: false,
            eager_instance_binding: true,
            inspect_visible: false,
            runtime_kind: RuntimeKind::LocalShell,
        }
    }
}
