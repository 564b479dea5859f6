// wis2box_processors - Observation processing and publication jobs
//
// Copyright 2024 wis2box_processors authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Interface to a BUFR codec.
//!
//! The transforms in this crate never touch BUFR bits directly. They work with
//! message handles that expose keyed access to header and data elements, the way
//! the ecCodes library does: `#1#latitude` addresses the first occurrence of the
//! `latitude` element and a bare `latitude` is shorthand for `#1#latitude`.
//!
//! Handles own their message. Dropping a handle releases it, so no handle can leak
//! out of the per-subset loop on an error path.

#[cfg(feature = "eccodes")]
pub mod eccodes;
pub mod keyed;

use thiserror::Error;

/// Indicator opening section 0 of every message
pub const START_SECTION: &[u8; 4] = b"BUFR";

/// Section 5, closing every message
pub const END_SECTION: &[u8; 4] = b"7777";

/// Length of section 0 plus section 5
pub(crate) const FRAME_OVERHEAD: usize = 12;

/// Value returned by `get_long` for an element encoded as missing
pub const MISSING_LONG: i64 = 2_147_483_647;

/// Value returned by `get_double` for an element encoded as missing
pub const MISSING_DOUBLE: f64 = -1e100;

/// Descriptor of the WIGOS identification sequence
pub const WIGOS_SEQUENCE: i64 = 301150;

pub fn is_missing_long(value: i64) -> bool {
    value == MISSING_LONG
}

pub fn is_missing_double(value: f64) -> bool {
    !value.is_finite() || value <= MISSING_DOUBLE / 10.0
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("wrong type for key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("message not unpacked")]
    NotUnpacked,

    #[error("invalid subset {index}, message has {count} subsets")]
    InvalidSubset { index: usize, count: usize },

    #[error("truncated message at offset {offset}: declared length {declared}, {available} bytes available")]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },

    #[error("missing end section at offset {offset}")]
    MissingEndSection { offset: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message of {0} bytes is too large to encode")]
    TooLarge(usize),

    #[error("ecCodes error {code} for {key}: {message}")]
    Library { key: String, code: i32, message: String },
}

/// A decoded BUFR message, or one subset extracted from it.
pub trait MessageHandle: Sized {
    /// Decode the data section. Data keys are unavailable until this succeeds.
    fn unpack(&mut self) -> Result<(), CodecError>;

    fn has_key(&self, key: &str) -> bool;

    fn is_missing(&self, key: &str) -> Result<bool, CodecError>;

    fn get_long(&self, key: &str) -> Result<i64, CodecError>;

    fn get_double(&self, key: &str) -> Result<f64, CodecError>;

    fn get_string(&self, key: &str) -> Result<String, CodecError>;

    fn get_long_array(&self, key: &str) -> Result<Vec<i64>, CodecError>;

    fn set_long(&mut self, key: &str, value: i64) -> Result<(), CodecError>;

    fn set_double(&mut self, key: &str, value: f64) -> Result<(), CodecError>;

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), CodecError>;

    fn set_long_array(&mut self, key: &str, values: &[i64]) -> Result<(), CodecError>;

    fn set_missing(&mut self, key: &str) -> Result<(), CodecError>;

    fn subset_count(&self) -> Result<usize, CodecError>;

    /// Clone subset `index` (1-based) into a new single-subset message.
    fn extract_subset(&self, index: usize) -> Result<Self, CodecError>;

    /// Copy every data element of this message into `target`.
    fn copy_data_to(&self, target: &mut Self) -> Result<(), CodecError>;

    /// Data element keys of the first subset in message order.
    fn data_keys(&self) -> Result<Vec<String>, CodecError>;

    /// Serialize the message.
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
}

/// Splits byte streams into messages and provides the BUFR edition 4 template.
pub trait BufrCodec: Send + Sync {
    type Message: MessageHandle + Send;

    /// Messages found in `bytes`, in stream order. A framing error is returned in
    /// place of the message it affects and ends the stream.
    fn messages(&self, bytes: &[u8]) -> Vec<Result<Self::Message, CodecError>>;

    /// Fresh single-subset BUFR4 message with default header values.
    fn template(&self) -> Result<Self::Message, CodecError>;
}

/// Complete messages in `bytes` in stream order. Anything before a `BUFR` indicator,
/// such as a bulletin heading, is skipped. The total length in section 0 must be
/// available and end with `7777`, otherwise an error is returned for that message
/// and the rest of the stream is ignored.
pub fn split_messages(bytes: &[u8]) -> Vec<Result<&[u8], CodecError>> {
    let mut out = Vec::new();
    let mut offset = 0;

    while let Some(pos) = bytes[offset..].windows(4).position(|w| w == START_SECTION) {
        let start = offset + pos;
        let available = bytes.len() - start;
        if available < FRAME_OVERHEAD {
            out.push(Err(CodecError::Truncated {
                offset: start,
                declared: FRAME_OVERHEAD,
                available,
            }));
            break;
        }

        let declared = u32::from_be_bytes([0, bytes[start + 4], bytes[start + 5], bytes[start + 6]]) as usize;
        if declared < FRAME_OVERHEAD || declared > available {
            out.push(Err(CodecError::Truncated {
                offset: start,
                declared,
                available,
            }));
            break;
        }

        let end = start + declared;
        if &bytes[end - 4..end] != END_SECTION {
            out.push(Err(CodecError::MissingEndSection { offset: start }));
            break;
        }

        out.push(Ok(&bytes[start..end]));
        offset = end;
    }

    out
}

/// Read a long element that is present and not encoded as missing
pub fn long_value<M: MessageHandle>(msg: &M, key: &str) -> Option<i64> {
    if !msg.has_key(key) {
        return None;
    }

    msg.get_long(key).ok().filter(|v| !is_missing_long(*v))
}

/// Read a double element that is present and not encoded as missing
pub fn double_value<M: MessageHandle>(msg: &M, key: &str) -> Option<f64> {
    if !msg.has_key(key) {
        return None;
    }

    msg.get_double(key).ok().filter(|v| !is_missing_double(*v))
}

/// Read a string element that is present and not blank
pub fn string_value<M: MessageHandle>(msg: &M, key: &str) -> Option<String> {
    if !msg.has_key(key) || msg.is_missing(key).unwrap_or(true) {
        return None;
    }

    msg.get_string(key)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}
