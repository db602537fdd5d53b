//! Topic service: registry, filter evaluation, and fan-out publishing.

pub mod filter;
pub mod publish;
pub mod registry;

pub use filter::FilterScope;
pub use publish::{
    PublishBatchEntry, PublishOutcome, PublishRequest, Publisher, QueueSink,
};
pub use registry::{Subscription, Topic, TopicRegistry};
