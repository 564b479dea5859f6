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

//! WMO BUFR through the ecCodes library.
//!
//! Requires the `eccodes` feature and ecCodes installed where `pkg-config` finds it.

use super::{split_messages, BufrCodec, CodecError, MessageHandle};
use eccodes_sys::codes_handle;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int, c_long};
use std::ptr::{self, NonNull};

/// `CODES_NOT_FOUND`
const NOT_FOUND: c_int = -10;

/// `CODES_KEYS_ITERATOR_ALL_KEYS`
const ALL_KEYS: std::os::raw::c_ulong = 0;

const SAMPLE: &str = "BUFR4";

fn c_key(key: &str) -> Result<CString, CodecError> {
    CString::new(key).map_err(|_| CodecError::KeyNotFound(key.to_owned()))
}

fn check(code: c_int, key: &str) -> Result<(), CodecError> {
    match code {
        0 => Ok(()),
        NOT_FOUND => Err(CodecError::KeyNotFound(key.to_owned())),
        _ => {
            // SAFETY: ecCodes returns a static string for every error code
            let message = unsafe {
                let msg = eccodes_sys::codes_get_error_message(code);
                if msg.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr(msg).to_string_lossy().into_owned()
                }
            };

            Err(CodecError::Library {
                key: key.to_owned(),
                code,
                message,
            })
        }
    }
}

fn to_c_long(key: &str, value: i64) -> Result<c_long, CodecError> {
    c_long::try_from(value).map_err(|_| CodecError::WrongType {
        key: key.to_owned(),
        expected: "C long",
    })
}

/// Owned ecCodes handle, deleted on drop.
#[derive(Debug)]
pub struct EcCodesMessage {
    handle: NonNull<codes_handle>,
}

// SAFETY: a handle is only ever used through the single message that owns it
unsafe impl Send for EcCodesMessage {}

impl Drop for EcCodesMessage {
    fn drop(&mut self) {
        // SAFETY: handle is valid and we own it
        unsafe {
            eccodes_sys::codes_handle_delete(self.handle.as_ptr());
        }
    }
}

impl EcCodesMessage {
    fn from_raw(handle: *mut codes_handle, what: &str) -> Result<Self, CodecError> {
        NonNull::new(handle)
            .map(|handle| EcCodesMessage { handle })
            .ok_or_else(|| CodecError::Malformed(format!("ecCodes could not create a handle from {}", what)))
    }

    fn ptr(&self) -> *mut codes_handle {
        self.handle.as_ptr()
    }

    fn duplicate(&self) -> Result<Self, CodecError> {
        // SAFETY: handle is valid, the clone is a new handle owned by the result
        let handle = unsafe { eccodes_sys::codes_handle_clone(self.ptr()) };
        Self::from_raw(handle, "a clone")
    }
}

impl MessageHandle for EcCodesMessage {
    fn unpack(&mut self) -> Result<(), CodecError> {
        self.set_long("unpack", 1)
    }

    fn has_key(&self, key: &str) -> bool {
        match c_key(key) {
            // SAFETY: handle is valid and the key is null-terminated
            Ok(k) => unsafe { eccodes_sys::codes_is_defined(self.ptr(), k.as_ptr()) != 0 },
            Err(_) => false,
        }
    }

    fn is_missing(&self, key: &str) -> Result<bool, CodecError> {
        let k = c_key(key)?;
        let mut err: c_int = 0;
        // SAFETY: handle is valid and the key is null-terminated
        let missing = unsafe { eccodes_sys::codes_is_missing(self.ptr(), k.as_ptr(), &mut err) };
        check(err, key)?;
        Ok(missing == 1)
    }

    fn get_long(&self, key: &str) -> Result<i64, CodecError> {
        let k = c_key(key)?;
        let mut value: c_long = 0;
        // SAFETY: handle is valid and the key is null-terminated
        check(
            unsafe { eccodes_sys::codes_get_long(self.ptr(), k.as_ptr(), &mut value) },
            key,
        )?;
        Ok(i64::from(value))
    }

    fn get_double(&self, key: &str) -> Result<f64, CodecError> {
        let k = c_key(key)?;
        let mut value: f64 = 0.0;
        // SAFETY: handle is valid and the key is null-terminated
        check(
            unsafe { eccodes_sys::codes_get_double(self.ptr(), k.as_ptr(), &mut value) },
            key,
        )?;
        Ok(value)
    }

    fn get_string(&self, key: &str) -> Result<String, CodecError> {
        let k = c_key(key)?;
        let mut length: usize = 0;
        // SAFETY: handle is valid and the key is null-terminated
        check(
            unsafe { eccodes_sys::codes_get_length(self.ptr(), k.as_ptr(), &mut length) },
            key,
        )?;

        let mut buf = vec![0u8; length + 1];
        let mut size = buf.len();
        // SAFETY: buf holds `size` bytes, ecCodes writes at most that many
        check(
            unsafe {
                eccodes_sys::codes_get_string(self.ptr(), k.as_ptr(), buf.as_mut_ptr() as *mut c_char, &mut size)
            },
            key,
        )?;

        CStr::from_bytes_until_nul(&buf)
            .map(|s| s.to_string_lossy().into_owned())
            .map_err(|_| CodecError::Malformed(format!("unterminated string for {}", key)))
    }

    fn get_long_array(&self, key: &str) -> Result<Vec<i64>, CodecError> {
        let k = c_key(key)?;
        let mut size: usize = 0;
        // SAFETY: handle is valid and the key is null-terminated
        check(
            unsafe { eccodes_sys::codes_get_size(self.ptr(), k.as_ptr(), &mut size) },
            key,
        )?;

        let mut values: Vec<c_long> = vec![0; size];
        // SAFETY: values holds `size` longs, ecCodes writes at most that many
        check(
            unsafe { eccodes_sys::codes_get_long_array(self.ptr(), k.as_ptr(), values.as_mut_ptr(), &mut size) },
            key,
        )?;

        values.truncate(size);
        Ok(values.into_iter().map(i64::from).collect())
    }

    fn set_long(&mut self, key: &str, value: i64) -> Result<(), CodecError> {
        let k = c_key(key)?;
        let value = to_c_long(key, value)?;
        // SAFETY: handle is valid and the key is null-terminated
        check(unsafe { eccodes_sys::codes_set_long(self.ptr(), k.as_ptr(), value) }, key)
    }

    fn set_double(&mut self, key: &str, value: f64) -> Result<(), CodecError> {
        let k = c_key(key)?;
        // SAFETY: handle is valid and the key is null-terminated
        check(unsafe { eccodes_sys::codes_set_double(self.ptr(), k.as_ptr(), value) }, key)
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), CodecError> {
        let k = c_key(key)?;
        let v = CString::new(value).map_err(|_| CodecError::WrongType {
            key: key.to_owned(),
            expected: "string without NUL",
        })?;
        let mut length = value.len();
        // SAFETY: handle is valid, key and value are null-terminated
        check(
            unsafe { eccodes_sys::codes_set_string(self.ptr(), k.as_ptr(), v.as_ptr(), &mut length) },
            key,
        )
    }

    fn set_long_array(&mut self, key: &str, values: &[i64]) -> Result<(), CodecError> {
        let k = c_key(key)?;
        let values = values
            .iter()
            .map(|v| to_c_long(key, *v))
            .collect::<Result<Vec<c_long>, _>>()?;
        // SAFETY: handle is valid and values holds `len` longs
        check(
            unsafe { eccodes_sys::codes_set_long_array(self.ptr(), k.as_ptr(), values.as_ptr(), values.len()) },
            key,
        )
    }

    fn set_missing(&mut self, key: &str) -> Result<(), CodecError> {
        let k = c_key(key)?;
        // SAFETY: handle is valid and the key is null-terminated
        check(unsafe { eccodes_sys::codes_set_missing(self.ptr(), k.as_ptr()) }, key)
    }

    fn subset_count(&self) -> Result<usize, CodecError> {
        let count = self.get_long("numberOfSubsets")?;
        usize::try_from(count).map_err(|_| CodecError::Malformed(format!("{} subsets", count)))
    }

    fn extract_subset(&self, index: usize) -> Result<Self, CodecError> {
        let count = self.subset_count()?;
        if index == 0 || index > count {
            return Err(CodecError::InvalidSubset { index, count });
        }

        let mut source = self.duplicate()?;
        source.unpack()?;
        source.set_long("extractSubset", index as i64)?;
        source.set_long("doExtractSubsets", 1)?;

        let mut subset = source.duplicate()?;
        subset.unpack()?;
        Ok(subset)
    }

    fn copy_data_to(&self, target: &mut Self) -> Result<(), CodecError> {
        // SAFETY: both handles are valid and distinct
        check(
            unsafe { eccodes_sys::codes_bufr_copy_data(self.ptr(), target.ptr()) },
            "data section",
        )
    }

    fn data_keys(&self) -> Result<Vec<String>, CodecError> {
        // SAFETY: handle is valid, the iterator is deleted before returning
        unsafe {
            let iter = eccodes_sys::codes_bufr_keys_iterator_new(self.ptr(), ALL_KEYS);
            if iter.is_null() {
                return Err(CodecError::NotUnpacked);
            }

            let mut keys = Vec::new();
            while eccodes_sys::codes_bufr_keys_iterator_next(iter) != 0 {
                let name = eccodes_sys::codes_bufr_keys_iterator_get_name(iter);
                if name.is_null() {
                    continue;
                }

                let name = CStr::from_ptr(name).to_string_lossy().into_owned();
                // Ranked names are data elements, the rest are header keys and attributes
                if name.starts_with('#') && !name.contains("->") {
                    keys.push(name);
                }
            }

            eccodes_sys::codes_bufr_keys_iterator_delete(iter);
            Ok(keys)
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let pack = c_key("pack")?;
        // SAFETY: handle is valid and the key is null-terminated
        check(unsafe { eccodes_sys::codes_set_long(self.ptr(), pack.as_ptr(), 1) }, "pack")?;

        let mut message: *const c_void = ptr::null();
        let mut length: usize = 0;
        // SAFETY: handle is valid, the message buffer belongs to the handle and is
        // copied before the handle can change again
        unsafe {
            check(
                eccodes_sys::codes_get_message(self.ptr(), &mut message, &mut length),
                "message",
            )?;
            if message.is_null() {
                return Err(CodecError::Malformed("ecCodes returned no message".to_owned()));
            }

            Ok(std::slice::from_raw_parts(message as *const u8, length).to_vec())
        }
    }
}

/// Codec for WMO BUFR backed by ecCodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EcCodesCodec;

impl EcCodesCodec {
    pub fn new() -> Self {
        EcCodesCodec
    }
}

impl BufrCodec for EcCodesCodec {
    type Message = EcCodesMessage;

    fn messages(&self, bytes: &[u8]) -> Vec<Result<EcCodesMessage, CodecError>> {
        split_messages(bytes)
            .into_iter()
            .map(|frame| {
                frame.and_then(|m| {
                    // SAFETY: ecCodes copies the message, the slice outlives the call
                    let handle = unsafe {
                        eccodes_sys::codes_handle_new_from_message_copy(
                            ptr::null_mut(),
                            m.as_ptr() as *const c_void,
                            m.len(),
                        )
                    };
                    EcCodesMessage::from_raw(handle, "message")
                })
            })
            .collect()
    }

    fn template(&self) -> Result<EcCodesMessage, CodecError> {
        let sample = c_key(SAMPLE)?;
        // SAFETY: sample name is null-terminated, the handle is owned by the result
        let handle = unsafe { eccodes_sys::codes_bufr_handle_new_from_samples(ptr::null_mut(), sample.as_ptr()) };
        EcCodesMessage::from_raw(handle, "the BUFR4 sample")
    }
}
