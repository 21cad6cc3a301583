//! Payload codecs and type identity.

use std::marker::PhantomData;

use bytes::Bytes;
use prost::Name;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Prefix of a type hash, followed by the hex SHA-256 of the type description.
pub const TYPE_HASH_PREFIX: &str = "RIHS01_";

/// Serializes and deserializes user messages of type `T`.
///
/// Failures surface as [`Error::Codec`].
pub trait MessageCodec<T>: Send + Sync {
    /// Serialize a message.
    fn encode(&self, message: &T) -> Result<Bytes>;

    /// Deserialize a message.
    fn decode(&self, bytes: Bytes) -> Result<T>;
}

/// Codec for prost messages.
pub struct ProstCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> ProstCodec<M> {
    /// Create a codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for ProstCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for ProstCodec<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProstCodec")
    }
}

impl<M> MessageCodec<M> for ProstCodec<M>
where
    M: prost::Message + Default,
{
    fn encode(&self, message: &M) -> Result<Bytes> {
        Ok(Bytes::from(message.encode_to_vec()))
    }

    fn decode(&self, bytes: Bytes) -> Result<M> {
        M::decode(bytes).map_err(|e| Error::codec(format!("failed to decode message: {e}")))
    }
}

/// Pass-through codec for already-serialized payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl MessageCodec<Bytes> for RawCodec {
    fn encode(&self, message: &Bytes) -> Result<Bytes> {
        Ok(message.clone())
    }

    fn decode(&self, bytes: Bytes) -> Result<Bytes> {
        Ok(bytes)
    }
}

/// Name and hash of a message or service type, as announced in tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    /// Type name.
    pub name: String,
    /// `RIHS01_<hex>` type hash.
    pub hash: String,
}

impl TypeInfo {
    /// Build type info, hashing `description` into the type hash.
    pub fn new(name: impl Into<String>, description: &str) -> Self {
        let digest = Sha256::digest(description.as_bytes());
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self {
            name: name.into(),
            hash: format!("{TYPE_HASH_PREFIX}{hex}"),
        }
    }

    /// Type info for a prost message, derived from its fully qualified name.
    pub fn of<M: Name>() -> Self {
        let full_name = M::full_name();
        Self::new(full_name.clone(), &full_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct AddTwoInts {
        #[prost(int64, tag = "1")]
        a: i64,
        #[prost(int64, tag = "2")]
        b: i64,
    }

    impl Name for AddTwoInts {
        const NAME: &'static str = "AddTwoInts";
        const PACKAGE: &'static str = "example_interfaces.srv";
    }

    #[test]
    fn prost_codec_roundtrip() {
        let codec = ProstCodec::<AddTwoInts>::new();
        let msg = AddTwoInts { a: 2, b: 40 };
        let bytes = codec.encode(&msg).unwrap();
        assert_eq!(codec.decode(bytes).unwrap(), msg);
    }

    #[test]
    fn prost_codec_reports_garbage() {
        let codec = ProstCodec::<AddTwoInts>::new();
        let err = codec.decode(Bytes::from_static(&[0xff, 0xff, 0xff])).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn raw_codec_passes_through() {
        let bytes = Bytes::from_static(b"cdr");
        assert_eq!(RawCodec.decode(RawCodec.encode(&bytes).unwrap()).unwrap(), bytes);
    }

    #[test]
    fn type_hash_format() {
        let info = TypeInfo::of::<AddTwoInts>();
        assert_eq!(info.name, "example_interfaces.srv.AddTwoInts");
        assert!(info.hash.starts_with(TYPE_HASH_PREFIX));
        assert_eq!(info.hash.len(), TYPE_HASH_PREFIX.len() + 64);
        assert_eq!(info, TypeInfo::of::<AddTwoInts>());
        assert_ne!(info.hash, TypeInfo::new("x", "other").hash);
    }
}
