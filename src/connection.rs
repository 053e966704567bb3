use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Opaque identifier of one physical control-channel session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub fn generate() -> Self { Self(Arc::from(uuid::Uuid::new_v4().to_string())) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self { Self(Arc::from(s)) }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self { Self(Arc::from(s)) }
}
