//! Queue service: message model, per-queue state machine, and registry.

pub mod attributes;
pub mod fifo;
pub mod message;
#[allow(clippy::module_inception)]
pub mod queue;
pub mod registry;

pub use attributes::{QueueAttributes, RedrivePolicy};
pub use message::{Message, MessageAttributeValue};
pub use queue::{
    DlqRedrive, Queue, QueueSnapshot, ReceivedMessage, SendMessageParams, SendOutcome,
};
pub use registry::{
    validate_batch_entry_ids, BatchEntryOutcome, CreateQueueRequest, QueueRegistry,
    ReceiveMessageRequest,
};
