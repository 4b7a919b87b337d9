//! UUID codec between `uuid::Uuid` and the storage engine's UUID column.
//!
//! Storage UUID columns carry the raw 16-byte big-endian form of a UUID.
//! Values read back from storage are held as raw bytes until decoded, so a
//! corrupted or truncated column surfaces as [`MalformedUuid`] instead of a
//! panic or a silently truncated identifier.
//!
//! Identifiers minted here are UUIDv7: the leading 48 bits are a Unix
//! millisecond timestamp, so byte order equals generation order and a
//! clustering column sorts chronologically within its partition.

use std::fmt;

use uuid::Uuid;

use crate::error::MalformedUuid;

/// Width of the binary UUID form
pub const UUID_LEN: usize = 16;

/// Binary UUID value as stored in (or read from) a storage column.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageUuid(Vec<u8>);

impl StorageUuid {
    /// Wrap bytes read back from storage. No length check happens here;
    /// [`decode`] performs it.
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for StorageUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match decode(self) {
            Ok(id) => write!(f, "StorageUuid({id})"),
            Err(_) => write!(f, "StorageUuid(<{} bytes>)", self.0.len()),
        }
    }
}

impl From<Uuid> for StorageUuid {
    fn from(id: Uuid) -> Self {
        encode(id)
    }
}

impl TryFrom<&StorageUuid> for Uuid {
    type Error = MalformedUuid;

    fn try_from(value: &StorageUuid) -> Result<Self, Self::Error> {
        decode(value)
    }
}

/// Encode an application UUID into its 16-byte storage form.
pub fn encode(id: Uuid) -> StorageUuid {
    StorageUuid(id.as_bytes().to_vec())
}

/// Decode a storage UUID back into an application UUID.
///
/// Fails with [`MalformedUuid`] unless exactly 16 bytes are present.
pub fn decode(value: &StorageUuid) -> Result<Uuid, MalformedUuid> {
    let bytes: [u8; UUID_LEN] = value
        .0
        .as_slice()
        .try_into()
        .map_err(|_| MalformedUuid { len: value.0.len() })?;
    Ok(Uuid::from_bytes(bytes))
}

/// Mint a fresh time-ordered identifier.
pub fn new_time_uuid() -> Uuid {
    Uuid::now_v7()
}
