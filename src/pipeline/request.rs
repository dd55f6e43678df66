//! Request attributes the limiter reads.

use std::collections::HashMap;
use std::net::IpAddr;

/// What the limiter needs to know about an incoming request.
pub trait RequestContext: Send + Sync {
    /// The client network address, as resolved by the host.
    fn client_addr(&self) -> Option<IpAddr>;

    /// A submitted field, e.g. the email of a login attempt.
    fn field(&self, name: &str) -> Option<&str>;

    /// The request path.
    fn path(&self) -> &str;
}

/// An owned request snapshot.
#[derive(Debug, Clone, Default)]
pub struct ClientRequest {
    client_addr: Option<IpAddr>,
    path: String,
    fields: HashMap<String, String>,
}

impl ClientRequest {
    /// Create a request from the given client address.
    pub fn new(client_addr: IpAddr) -> Self {
        Self {
            client_addr: Some(client_addr),
            path: "/".to_string(),
            fields: HashMap::new(),
        }
    }

    /// Create a request whose client address could not be resolved.
    pub fn anonymous() -> Self {
        Self {
            path: "/".to_string(),
            ..Self::default()
        }
    }

    /// Set the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Add a submitted field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

impl RequestContext for ClientRequest {
    fn client_addr(&self) -> Option<IpAddr> {
        self.client_addr
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn path(&self) -> &str {
        &self.path
    }
}
