// Trigger notification delivery

pub mod broadcast;
pub mod nats;
pub mod publisher;

pub use broadcast::BroadcastTriggerPublisher;
pub use nats::{NatsClient, NatsConfig};
pub use publisher::{NatsTriggerPublisher, TriggerPublisher};
