//! Classification info blob passed to the native create services.
//!
//! Layout (44 bytes):
//!
//! | Offset | Length | Field |
//! |---|---|---|
//! | 0 | 1 | version (1) |
//! | 20 | 8 | transaction class, IBM-1047, blank padded |
//! | 36 | 8 | transaction name, IBM-1047, blank padded |
//!
//! All other bytes are zero. An absent transaction name leaves its field
//! zero filled.

use std::fmt;

use tracing::warn;

use crate::ebcdic::{UnmappableChar, IBM1047};

/// Length of a blank-padded classification field.
pub const FIELD_LENGTH: usize = 8;

const VERSION: u8 = 1;
const CLASS_OFFSET: usize = 20;
const NAME_OFFSET: usize = 36;

/// Encode one classification field: IBM-1047, truncated to eight bytes and
/// padded with EBCDIC blanks.
///
/// Characters outside IBM-1047 become the EBCDIC substitute byte, with a
/// warning. Configured classes are checked with [`try_encode_field`] first.
pub fn encode_field(value: &str) -> [u8; FIELD_LENGTH] {
    let bytes = match IBM1047.encode(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(value = %value, error = %e, "Code page conversion failed, substituting");
            IBM1047.encode_lossy(value)
        }
    };
    pad_field(&bytes)
}

/// Encode a field that must survive the round trip exactly.
pub fn try_encode_field(value: &str) -> Result<[u8; FIELD_LENGTH], FieldError> {
    let bytes = IBM1047.encode(value)?;
    if bytes.len() > FIELD_LENGTH {
        return Err(FieldError::TooLong(bytes.len()));
    }
    Ok(pad_field(&bytes))
}

fn pad_field(bytes: &[u8]) -> [u8; FIELD_LENGTH] {
    let mut field = [IBM1047.space(); FIELD_LENGTH];
    let len = bytes.len().min(FIELD_LENGTH);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Why text cannot be stored in a classification field as is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    /// A character has no IBM-1047 byte.
    #[error(transparent)]
    Unmappable(#[from] UnmappableChar),
    /// Encoded form exceeds the field.
    #[error("encodes to {0} bytes, field holds 8")]
    TooLong(usize),
}

/// Decode one classification field, trimming trailing blanks and zeros.
pub fn decode_field(field: &[u8]) -> String {
    let text = IBM1047.decode(field);
    text.trim_end_matches([' ', '\0']).to_string()
}

/// The fixed-layout classification record.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClassificationInfo {
    bytes: [u8; ClassificationInfo::LENGTH],
}

impl ClassificationInfo {
    /// Record length in bytes.
    pub const LENGTH: usize = 44;

    /// Build the record for a transaction class and optional name.
    pub fn new(transaction_class: &str, transaction_name: Option<&str>) -> Self {
        let mut bytes = [0u8; Self::LENGTH];
        bytes[0] = VERSION;
        bytes[CLASS_OFFSET..CLASS_OFFSET + FIELD_LENGTH]
            .copy_from_slice(&encode_field(transaction_class));
        if let Some(name) = transaction_name {
            bytes[NAME_OFFSET..NAME_OFFSET + FIELD_LENGTH].copy_from_slice(&encode_field(name));
        }
        Self { bytes }
    }

    /// Record carrying an already encoded transaction class and no name.
    pub fn for_class_field(transaction_class: &[u8; FIELD_LENGTH]) -> Self {
        let mut bytes = [0u8; Self::LENGTH];
        bytes[0] = VERSION;
        bytes[CLASS_OFFSET..CLASS_OFFSET + FIELD_LENGTH].copy_from_slice(transaction_class);
        Self { bytes }
    }

    /// Wrap a record received from native code. Returns `None` when the
    /// length or version is wrong.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::LENGTH] = bytes.try_into().ok()?;
        if bytes[0] != VERSION {
            return None;
        }
        Some(Self { bytes })
    }

    /// Raw record bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Record version.
    pub fn version(&self) -> u8 {
        self.bytes[0]
    }

    /// Transaction class, padding removed.
    pub fn transaction_class(&self) -> String {
        decode_field(&self.bytes[CLASS_OFFSET..CLASS_OFFSET + FIELD_LENGTH])
    }

    /// Transaction name, padding removed. A zero-filled field is empty.
    pub fn transaction_name(&self) -> String {
        decode_field(&self.bytes[NAME_OFFSET..NAME_OFFSET + FIELD_LENGTH])
    }

    /// Both fields as `(class, name)`.
    pub fn decode(&self) -> (String, String) {
        (self.transaction_class(), self.transaction_name())
    }
}

impl fmt::Debug for ClassificationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationInfo")
            .field("version", &self.version())
            .field("transaction_class", &self.transaction_class())
            .field("transaction_name", &self.transaction_name())
            .finish()
    }
}
