//! Correlation attachment carried alongside every request and reply.
//!
//! The record is self-describing so that a foreign or corrupted attachment is
//! detected instead of being misread. It is a postcard-encoded list of named,
//! typed fields in a fixed order:
//!
//! ```text
//! [("sequence_number", I64), ("source_timestamp", I64), ("source_gid", Bytes[16])]
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Size of a globally unique entity id.
pub const GID_SIZE: usize = 16;

/// Globally unique id of the entity that originated a request or reply.
pub type Gid = [u8; GID_SIZE];

const SEQUENCE_NUMBER: &str = "sequence_number";
const SOURCE_TIMESTAMP: &str = "source_timestamp";
const SOURCE_GID: &str = "source_gid";

/// Reason an attachment was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachmentError {
    /// The record ended before this field.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A field name other than the expected one was found.
    #[error("expected field `{expected}`, found `{found}`")]
    UnexpectedKey {
        /// Field that should appear at this position.
        expected: &'static str,
        /// Field name actually present.
        found: String,
    },

    /// The field value has the wrong type.
    #[error("field `{0}` has an unexpected type")]
    TypeMismatch(&'static str),

    /// The gid is not exactly [`GID_SIZE`] bytes.
    #[error("source_gid must be 16 bytes, found {0}")]
    BadGidLength(usize),

    /// A correlation field decoded as negative.
    #[error("field `{0}` is negative")]
    Negative(&'static str),

    /// The record has more fields than expected.
    #[error("{0} unexpected fields after attachment")]
    ExtraFields(usize),

    /// Bytes remain after the record.
    #[error("{0} trailing bytes after attachment")]
    TrailingBytes(usize),

    /// The bytes are not a field list at all.
    #[error("malformed attachment: {0}")]
    Malformed(String),

    /// The record could not be serialized.
    #[error("failed to encode attachment: {0}")]
    Encode(String),
}

type AttachmentResult<T> = std::result::Result<T, AttachmentError>;

/// Typed value of one attachment field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Value {
    I64(i64),
    Bytes(Vec<u8>),
}

type Field = (String, Value);

/// Correlation record: who sent a message, when, and under which sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentData {
    sequence_number: i64,
    source_timestamp: i64,
    source_gid: Gid,
}

impl AttachmentData {
    /// Create a record from its parts.
    pub fn new(sequence_number: i64, source_timestamp: i64, source_gid: Gid) -> Self {
        Self {
            sequence_number,
            source_timestamp,
            source_gid,
        }
    }

    /// Create a record stamped with the current wall-clock time.
    pub fn stamped(sequence_number: i64, source_gid: Gid) -> Self {
        Self::new(sequence_number, now_nanos(), source_gid)
    }

    /// Sequence number of the request this record belongs to.
    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    /// Source timestamp in nanoseconds since the unix epoch.
    pub fn source_timestamp(&self) -> i64 {
        self.source_timestamp
    }

    /// Gid of the originating entity.
    pub fn source_gid(&self) -> Gid {
        self.source_gid
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            (SEQUENCE_NUMBER.to_string(), Value::I64(self.sequence_number)),
            (SOURCE_TIMESTAMP.to_string(), Value::I64(self.source_timestamp)),
            (SOURCE_GID.to_string(), Value::Bytes(self.source_gid.to_vec())),
        ]
    }

    /// Serialize the record.
    pub fn encode(&self) -> AttachmentResult<Bytes> {
        encode_fields(&self.fields())
    }

    /// Deserialize a record, rejecting anything that does not match the schema.
    ///
    /// Negative sequence numbers or timestamps are rejected as well: they only
    /// come from corrupted or foreign attachments.
    pub fn decode(bytes: &[u8]) -> AttachmentResult<Self> {
        if bytes.is_empty() {
            return Err(AttachmentError::MissingField(SEQUENCE_NUMBER));
        }
        let (fields, rest) = postcard::take_from_bytes::<Vec<Field>>(bytes)
            .map_err(|e| AttachmentError::Malformed(e.to_string()))?;
        if !rest.is_empty() {
            return Err(AttachmentError::TrailingBytes(rest.len()));
        }

        let mut fields = fields.into_iter();
        let sequence_number = expect_i64(fields.next(), SEQUENCE_NUMBER)?;
        let source_timestamp = expect_i64(fields.next(), SOURCE_TIMESTAMP)?;
        let gid = expect_bytes(fields.next(), SOURCE_GID)?;
        let extra = fields.count();
        if extra > 0 {
            return Err(AttachmentError::ExtraFields(extra));
        }

        let source_gid =
            Gid::try_from(gid.as_slice()).map_err(|_| AttachmentError::BadGidLength(gid.len()))?;
        if sequence_number < 0 {
            return Err(AttachmentError::Negative(SEQUENCE_NUMBER));
        }
        if source_timestamp < 0 {
            return Err(AttachmentError::Negative(SOURCE_TIMESTAMP));
        }
        Ok(Self::new(sequence_number, source_timestamp, source_gid))
    }
}

/// Header delivered with a taken request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Sequence number the client assigned to the request.
    pub sequence_number: i64,
    /// When the sender stamped the message.
    pub source_timestamp: i64,
    /// Gid of the requesting client.
    pub source_gid: Gid,
    /// When the message was received locally.
    pub received_timestamp: i64,
}

impl ServiceInfo {
    /// Combine a decoded attachment with the local arrival time.
    pub fn new(attachment: &AttachmentData, received_timestamp: i64) -> Self {
        Self {
            sequence_number: attachment.sequence_number,
            source_timestamp: attachment.source_timestamp,
            source_gid: attachment.source_gid,
            received_timestamp,
        }
    }
}

/// Current wall-clock time in nanoseconds since the unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn encode_fields(fields: &[Field]) -> AttachmentResult<Bytes> {
    postcard::to_allocvec(fields)
        .map(Bytes::from)
        .map_err(|e| AttachmentError::Encode(e.to_string()))
}

fn expect_field(field: Option<Field>, expected: &'static str) -> AttachmentResult<Value> {
    match field {
        None => Err(AttachmentError::MissingField(expected)),
        Some((key, _)) if key != expected => Err(AttachmentError::UnexpectedKey {
            expected,
            found: key,
        }),
        Some((_, value)) => Ok(value),
    }
}

fn expect_i64(field: Option<Field>, expected: &'static str) -> AttachmentResult<i64> {
    match expect_field(field, expected)? {
        Value::I64(v) => Ok(v),
        Value::Bytes(_) => Err(AttachmentError::TypeMismatch(expected)),
    }
}

fn expect_bytes(field: Option<Field>, expected: &'static str) -> AttachmentResult<Vec<u8>> {
    match expect_field(field, expected)? {
        Value::Bytes(v) => Ok(v),
        Value::I64(_) => Err(AttachmentError::TypeMismatch(expected)),
    }
}
