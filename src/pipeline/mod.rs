pub mod connection;
pub mod decode;
pub mod topology;

pub use connection::{Backoff, ConnectionManager, SessionId, SessionKind};
pub use decode::VideoPipeline;
pub use topology::{Delivery, DiscardSink, Subscription, Topology, TopologyState};
