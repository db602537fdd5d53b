//! Object store: buckets, keys, listings, and multipart uploads.

pub mod bucket;
pub mod multipart;
pub mod object;

pub use bucket::{GetObjectResult, ListResult, ObjectContent, ObjectStore, ObjectSummary};
pub use multipart::CompletedPartRef;
pub use object::{Conditions, StoredObject};
