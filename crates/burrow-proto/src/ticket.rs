//! Request tickets

use uuid::Uuid;

/// One-use identifier that rendezvous a public request with the stream
/// the tunnel client opens in reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestTicket(String);

impl RequestTicket {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
