//! In-process wiring of the Ferry relay and its two peer endpoints.

pub mod approve;
pub mod host;
pub mod send;

pub use approve::PromptApprover;
pub use host::{EndpointReport, TaskHost};
pub use send::{run_send, SendRequest, SendSummary, MAX_RESTARTS};
