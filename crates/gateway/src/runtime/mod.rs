//! Run producer/consumer pipeline (C9), its in-memory buffer (C8), the
//! per-thread serialization and cancellation primitives (C10), and the
//! abstract collaborator interface for the LLM agent graph.
//!
//! The agent graph and tool implementations themselves are out of scope —
//! [`agent_graph::AgentGraph`] is the seam at which this crate treats them
//! as an external collaborator.

pub mod agent_graph;
pub mod buffer;
pub mod cancel;
pub mod pipeline;
pub mod registry;
pub mod session_lock;
