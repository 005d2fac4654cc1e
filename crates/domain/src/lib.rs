pub mod capability;
pub mod error;
pub mod lifecycle;
pub mod run_event;
pub mod trace;

pub use capability::{ProviderCapability, RuntimeKind};
pub use error::{Error, Result};
pub use lifecycle::{
    assert_chat_session_transition, assert_lease_observed_transition, ChatSessionStatus,
    LeaseDesiredState, LeaseObservedState,
};
pub use run_event::{RunEvent, RunEventKind};
pub use trace::TraceEvent;
