//! Multipart upload assembly.
//!
//! Parts are buffered per upload id and stitched together on completion.
//! The completed ETag is `"<hex>-<n>"` where `<hex>` is the MD5 of the
//! concatenated 16-byte part digests, in part-number order.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};

use crate::error::{Result, ServiceError};

/// Highest allowed part number.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// One buffered part.
#[derive(Debug, Clone)]
pub struct UploadedPart {
    pub data: Bytes,
    /// Unquoted MD5 hex of the part body.
    pub etag: String,
}

/// An in-progress multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub key: String,
    pub content_type: Option<String>,
    pub metadata: Vec<(String, String)>,
    pub parts: HashMap<u32, UploadedPart>,
}

impl MultipartUpload {
    pub fn new(
        upload_id: String,
        key: String,
        content_type: Option<String>,
        metadata: Vec<(String, String)>,
    ) -> Self {
        Self {
            upload_id,
            key,
            content_type,
            metadata,
            parts: HashMap::new(),
        }
    }

    /// Buffer a part, replacing any previous upload of the same number.
    pub fn put_part(&mut self, part_number: u32, data: Bytes) -> Result<String> {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(ServiceError::InvalidPart(format!(
                "Part number must be between 1 and {MAX_PART_NUMBER}"
            )));
        }
        let mut hasher = Md5::new();
        hasher.update(&data);
        let etag = hex::encode(hasher.finalize());
        self.parts.insert(
            part_number,
            UploadedPart {
                data,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }
}

/// The caller's view of a part in a Complete request.
#[derive(Debug, Clone)]
pub struct CompletedPartRef {
    pub part_number: u32,
    pub etag: String,
}

/// Stitch the referenced parts together, verifying order and ETags.
pub fn assemble(upload: &MultipartUpload, parts: &[CompletedPartRef]) -> Result<(Bytes, String)> {
    if parts.is_empty() {
        return Err(ServiceError::InvalidPart(
            "The multipart completion request contains no parts".to_string(),
        ));
    }
    for window in parts.windows(2) {
        if window[1].part_number <= window[0].part_number {
            return Err(ServiceError::InvalidPartOrder);
        }
    }

    let mut body = BytesMut::new();
    let mut digests: Vec<u8> = Vec::with_capacity(parts.len() * 16);
    for reference in parts {
        let part = upload.parts.get(&reference.part_number).ok_or_else(|| {
            ServiceError::InvalidPart(format!(
                "Part number {} has not been uploaded",
                reference.part_number
            ))
        })?;
        if reference.etag.trim_matches('"') != part.etag {
            return Err(ServiceError::InvalidPart(format!(
                "ETag of part {} does not match",
                reference.part_number
            )));
        }
        body.extend_from_slice(&part.data);
        digests.extend_from_slice(&hex::decode(&part.etag).unwrap_or_default());
    }

    let mut hasher = Md5::new();
    hasher.update(&digests);
    let etag = format!("{}-{}", hex::encode(hasher.finalize()), parts.len());
    Ok((body.freeze(), etag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_with_two_parts() -> MultipartUpload {
        let mut upload = MultipartUpload::new("u1".to_string(), "k".to_string(), None, Vec::new());
        upload
            .put_part(1, Bytes::from_static(b"abcde"))
            .expect("part 1");
        upload
            .put_part(2, Bytes::from_static(b"fghij"))
            .expect("part 2");
        upload
    }

    #[test]
    fn test_part_etags_are_md5() {
        let upload = upload_with_two_parts();
        assert_eq!(
            upload.parts[&1].etag,
            "ab56b4d92b40713acc5af89985d4b786"
        );
        assert_eq!(
            upload.parts[&2].etag,
            "57c48dcd266eadf089325affe125151f"
        );
    }

    #[test]
    fn test_assemble_concatenates_and_derives_compound_etag() {
        let upload = upload_with_two_parts();
        let refs = vec![
            CompletedPartRef {
                part_number: 1,
                etag: "ab56b4d92b40713acc5af89985d4b786".to_string(),
            },
            CompletedPartRef {
                part_number: 2,
                etag: "\"57c48dcd266eadf089325affe125151f\"".to_string(),
            },
        ];
        let (body, etag) = assemble(&upload, &refs).expect("assemble");
        assert_eq!(&body[..], b"abcdefghij");

        // MD5 over the two concatenated 16-byte digests, suffixed by count.
        let mut digests = Vec::new();
        digests.extend_from_slice(
            &hex::decode("ab56b4d92b40713acc5af89985d4b786").expect("digest 1"),
        );
        digests.extend_from_slice(
            &hex::decode("57c48dcd266eadf089325affe125151f").expect("digest 2"),
        );
        let mut hasher = Md5::new();
        hasher.update(&digests);
        let expected = format!("{}-2", hex::encode(hasher.finalize()));
        assert_eq!(etag, expected);
    }

    #[test]
    fn test_assemble_rejects_descending_order() {
        let upload = upload_with_two_parts();
        let refs = vec![
            CompletedPartRef {
                part_number: 2,
                etag: upload.parts[&2].etag.clone(),
            },
            CompletedPartRef {
                part_number: 1,
                etag: upload.parts[&1].etag.clone(),
            },
        ];
        assert!(matches!(
            assemble(&upload, &refs),
            Err(ServiceError::InvalidPartOrder)
        ));
    }

    #[test]
    fn test_assemble_rejects_missing_or_mismatched_part() {
        let upload = upload_with_two_parts();
        let missing = vec![CompletedPartRef {
            part_number: 3,
            etag: "whatever".to_string(),
        }];
        assert!(matches!(
            assemble(&upload, &missing),
            Err(ServiceError::InvalidPart(_))
        ));

        let mismatched = vec![CompletedPartRef {
            part_number: 1,
            etag: "0000".to_string(),
        }];
        assert!(matches!(
            assemble(&upload, &mismatched),
            Err(ServiceError::InvalidPart(_))
        ));
    }

    #[test]
    fn test_part_number_bounds() {
        let mut upload = MultipartUpload::new("u".to_string(), "k".to_string(), None, Vec::new());
        assert!(upload.put_part(0, Bytes::new()).is_err());
        assert!(upload.put_part(MAX_PART_NUMBER + 1, Bytes::new()).is_err());
        assert!(upload.put_part(MAX_PART_NUMBER, Bytes::new()).is_ok());
    }
}
