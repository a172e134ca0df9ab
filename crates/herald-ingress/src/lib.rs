//! Herald ingress: payload validation, idempotent submission, and the HTTP
//! API surface (status, attempts, batch queries, probes, metrics).

pub mod api;
pub mod submit;
pub mod validate;

pub use api::{router, ApiState};
pub use submit::{SubmissionService, SubmitAccepted, SubmitRequest};
pub use validate::{validate_context, validate_recipient};
