//! Error taxonomy shared by the queue, topic, and object services.
//!
//! The core signals typed errors; only the HTTP shell knows how to render
//! them into AWS wire envelopes. Each variant carries enough to map onto a
//! wire code, an HTTP status, and a sender-vs-server classification.

use http::StatusCode;
use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Who is at fault for an error, in AWS envelope terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Sender,
    Server,
}

/// Errors surfaced by the emulated services.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    // -- client input ------------------------------------------------------
    #[error("The request must contain the parameter {0}")]
    MissingParameter(String),

    #[error("{0}")]
    InvalidParameterValue(String),

    #[error("Unknown attribute name: {0}")]
    InvalidAttributeName(String),

    #[error("{0}")]
    InvalidAttributeValue(String),

    #[error("Invalid characters found in the message body")]
    InvalidMessageContents,

    #[error("A batch entry id is invalid: {0}")]
    InvalidBatchEntryId(String),

    #[error("Two or more batch entries in the request have the same Id")]
    BatchEntryIdsNotDistinct,

    #[error("The batch request doesn't contain any entries")]
    EmptyBatchRequest,

    #[error("The batch request contains more entries than permissible")]
    TooManyEntriesInBatchRequest,

    // -- not found ---------------------------------------------------------
    #[error("The specified queue does not exist: {0}")]
    NonExistentQueue(String),

    #[error("Resource does not exist: {0}")]
    NotFound(String),

    #[error("The specified bucket does not exist: {0}")]
    NoSuchBucket(String),

    #[error("The specified key does not exist: {0}")]
    NoSuchKey(String),

    #[error("The specified multipart upload does not exist: {0}")]
    NoSuchUpload(String),

    // -- state -------------------------------------------------------------
    #[error("The specified message isn't in flight")]
    MessageNotInflight,

    #[error("The receipt handle is invalid: {0}")]
    ReceiptHandleIsInvalid(String),

    #[error("{0}")]
    InvalidPart(String),

    #[error("The list of parts was not in ascending order")]
    InvalidPartOrder,

    #[error("The bucket you tried to delete is not empty: {0}")]
    BucketNotEmpty(String),

    #[error("At least one of the preconditions you specified did not hold")]
    PreconditionFailed,

    #[error("The requested range is not satisfiable")]
    InvalidRange,

    // -- conflict ----------------------------------------------------------
    #[error("A queue already exists with the same name and a different value for attribute {0}")]
    QueueNameExists(String),

    #[error("{0}")]
    InvalidParameter(String),

    // -- everything else ---------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Wire-level error code, as AWS clients expect to see it.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingParameter(_) => "MissingParameter",
            Self::InvalidParameterValue(_) => "InvalidParameterValue",
            Self::InvalidAttributeName(_) => "InvalidAttributeName",
            Self::InvalidAttributeValue(_) => "InvalidAttributeValue",
            Self::InvalidMessageContents => "InvalidMessageContents",
            Self::InvalidBatchEntryId(_) => "AWS.SimpleQueueService.InvalidBatchEntryId",
            Self::BatchEntryIdsNotDistinct => "AWS.SimpleQueueService.BatchEntryIdsNotDistinct",
            Self::EmptyBatchRequest => "AWS.SimpleQueueService.EmptyBatchRequest",
            Self::TooManyEntriesInBatchRequest => {
                "AWS.SimpleQueueService.TooManyEntriesInBatchRequest"
            }
            Self::NonExistentQueue(_) => "AWS.SimpleQueueService.NonExistentQueue",
            Self::NotFound(_) => "NotFound",
            Self::NoSuchBucket(_) => "NoSuchBucket",
            Self::NoSuchKey(_) => "NoSuchKey",
            Self::NoSuchUpload(_) => "NoSuchUpload",
            Self::MessageNotInflight => "AWS.SimpleQueueService.MessageNotInflight",
            Self::ReceiptHandleIsInvalid(_) => "ReceiptHandleIsInvalid",
            Self::InvalidPart(_) => "InvalidPart",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::BucketNotEmpty(_) => "BucketNotEmpty",
            Self::PreconditionFailed => "PreconditionFailed",
            Self::InvalidRange => "InvalidRange",
            Self::QueueNameExists(_) => "QueueAlreadyExists",
            Self::InvalidParameter(_) => "InvalidParameter",
            Self::Internal(_) => "InternalFailure",
        }
    }

    /// HTTP status the shell should respond with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NonExistentQueue(_)
            | Self::NotFound(_)
            | Self::NoSuchBucket(_)
            | Self::NoSuchKey(_)
            | Self::NoSuchUpload(_) => StatusCode::NOT_FOUND,
            Self::QueueNameExists(_) | Self::BucketNotEmpty(_) => StatusCode::CONFLICT,
            Self::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            Self::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Sender-vs-server classification for the wire envelope.
    pub fn fault(&self) -> Fault {
        match self {
            Self::Internal(_) => Fault::Server,
            _ => Fault::Sender,
        }
    }
}
