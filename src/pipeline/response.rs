//! What the limiter hands back to the host framework.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ratelimit::Decision;

/// Status used by the default rejection.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// The `X-RateLimit-*` headers attached to every checked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Configured maximum
    pub limit: u64,
    /// Hits left in the window, never negative
    pub remaining: u64,
    /// When the window lapses
    pub reset: DateTime<Utc>,
}

impl RateLimitHeaders {
    pub const LIMIT: &'static str = "X-RateLimit-Limit";
    pub const REMAINING: &'static str = "X-RateLimit-Remaining";
    pub const RESET: &'static str = "X-RateLimit-Reset";

    /// Build the headers for a decision.
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at,
        }
    }

    /// Render as name/value pairs. The reset time is ISO-8601 in UTC.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        vec![
            (Self::LIMIT.to_string(), self.limit.to_string()),
            (Self::REMAINING.to_string(), self.remaining.to_string()),
            (
                Self::RESET.to_string(),
                self.reset.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ]
    }
}

/// JSON body of the default rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialBody {
    pub success: bool,
    pub error: DenialError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialError {
    pub message: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
}

/// A short-circuit response the host must send instead of running the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// HTTP status code
    pub status: u16,
    /// Headers to attach
    pub headers: Vec<(String, String)>,
    /// JSON body, if any
    pub body: Option<serde_json::Value>,
}

impl Rejection {
    /// Create a bare rejection with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the JSON body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// The default denial: 429, rate limit headers, `Retry-After`, and
    /// `{"success": false, "error": {"message", "retryAfter"}}`.
    pub fn too_many_requests(decision: &Decision, message: &str) -> Self {
        let retry_after = decision.retry_after_secs.unwrap_or(0);
        let body = DenialBody {
            success: false,
            error: DenialError {
                message: message.to_string(),
                retry_after,
            },
        };

        let mut rejection = Self::new(TOO_MANY_REQUESTS);
        rejection.headers = RateLimitHeaders::from_decision(decision).to_pairs();
        rejection.body = serde_json::to_value(&body).ok();
        rejection.with_header("Retry-After", retry_after.to_string())
    }

    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// What the host should do with the request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Run the handler, attaching these headers to its response.
    Proceed { headers: Vec<(String, String)> },
    /// Send this response instead.
    Reject(Rejection),
}

impl Admission {
    /// Proceed with no headers (skipped or failed open).
    pub fn pass() -> Self {
        Admission::Proceed {
            headers: Vec::new(),
        }
    }

    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Proceed { .. })
    }

    /// Headers to attach, whichever way the request goes.
    pub fn headers(&self) -> &[(String, String)] {
        match self {
            Admission::Proceed { headers } => headers,
            Admission::Reject(rejection) => &rejection.headers,
        }
    }

    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(self.headers(), name)
    }

    /// The rejection status, if rejected.
    pub fn status(&self) -> Option<u16> {
        match self {
            Admission::Proceed { .. } => None,
            Admission::Reject(rejection) => Some(rejection.status),
        }
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
