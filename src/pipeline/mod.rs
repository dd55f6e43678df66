//! Boundary with the host request-handling framework.
//!
//! The host exposes each request through [`RequestContext`] and applies the
//! [`Admission`] it gets back: attach the headers and continue, or
//! short-circuit with the [`Rejection`].

mod request;
mod response;

pub use request::{ClientRequest, RequestContext};
pub use response::{Admission, DenialBody, DenialError, RateLimitHeaders, Rejection};
