//! Key-log fan-out from a single capture source to subscribed connections.

mod registry;
mod source;

pub use registry::{KeyLogRegistry, KeyLogSubscription};
pub use source::{format_key, select_key_source, EvdevKeySource, KeySink, KeySource, LoopbackKeySource};
