// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Conversion between cached items and their byte representation.

use crate::error::CodecError;

/// Serializes items into cache payloads and back.
///
/// A [`Namespace`](crate::Namespace) owns one codec and uses it for every `get` and `set`.
/// Deserialization always works on a private copy of the payload.
pub trait Codec: Send + Sync {
    /// The type of the cached items.
    type Item;

    /// Appends the representation of `item` to `out`, which is empty on entry.
    ///
    /// # Errors
    ///
    /// Returns an error if `item` cannot be represented.
    fn serialize(&self, item: &Self::Item, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Rebuilds an item from its representation.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid representation.
    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Item, CodecError>;
}

/// Caches raw byte vectors as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Item = Vec<u8>;

    fn serialize(&self, item: &Vec<u8>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(item);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// A codec built from a pair of closures.
///
/// # Examples
///
/// ```
/// use membuffer::{Codec, FnCodec};
///
/// let codec = FnCodec::new(
///     |item: &u32, out: &mut Vec<u8>| {
///         out.extend_from_slice(&item.to_le_bytes());
///         Ok(())
///     },
///     |bytes: &[u8]| Ok(u32::from_le_bytes(bytes.try_into()?)),
/// );
///
/// let mut bytes = Vec::new();
/// codec.serialize(&7, &mut bytes).unwrap();
/// assert_eq!(codec.deserialize(&bytes).unwrap(), 7);
/// ```
pub struct FnCodec<T, Ser, De> {
    serialize: Ser,
    deserialize: De,
    _item: std::marker::PhantomData<fn() -> T>,
}

impl<T, Ser, De> FnCodec<T, Ser, De>
where
    Ser: Fn(&T, &mut Vec<u8>) -> Result<(), CodecError> + Send + Sync,
    De: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync,
{
    /// Creates a codec from a serializer and a deserializer.
    pub const fn new(serialize: Ser, deserialize: De) -> Self {
        Self {
            serialize,
            deserialize,
            _item: std::marker::PhantomData,
        }
    }
}

impl<T, Ser, De> Codec for FnCodec<T, Ser, De>
where
    Ser: Fn(&T, &mut Vec<u8>) -> Result<(), CodecError> + Send + Sync,
    De: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync,
{
    type Item = T;

    fn serialize(&self, item: &T, out: &mut Vec<u8>) -> Result<(), CodecError> {
        (self.serialize)(item, out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, CodecError> {
        (self.deserialize)(bytes)
    }
}

impl<T, Ser, De> std::fmt::Debug for FnCodec<T, Ser, De> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCodec").finish_non_exhaustive()
    }
}

/// Caches any serde type in bincode form.
#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
pub struct BincodeCodec<T> {
    _item: std::marker::PhantomData<fn() -> T>,
}

#[cfg(feature = "serde")]
impl<T> BincodeCodec<T> {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _item: std::marker::PhantomData,
        }
    }
}

#[cfg(feature = "serde")]
impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "serde")]
impl<T> std::fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BincodeCodec").finish()
    }
}

#[cfg(feature = "serde")]
impl<T> Codec for BincodeCodec<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    type Item = T;

    fn serialize(&self, item: &T, out: &mut Vec<u8>) -> Result<(), CodecError> {
        bincode::serialize_into(out, item).map_err(Into::into)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(Into::into)
    }
}
