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

//! In-process codec for keyed messages.
//!
//! Messages are framed like BUFR (`BUFR`, a 3 octet total length, the edition number,
//! the body and a closing `7777`) so that multi-message streams and leading bulletin
//! headings are handled the same way as real bulletins. The body is the list of keyed
//! header and data elements serialized as JSON rather than bit-packed sections.
//!
//! Output is not WMO BUFR and no other system can decode it. The codec backs the
//! processor tests and builds without the `eccodes` feature, the server binary always
//! uses [`super::eccodes::EcCodesCodec`].

use super::{
    split_messages, BufrCodec, CodecError, MessageHandle, END_SECTION, FRAME_OVERHEAD, MISSING_DOUBLE, MISSING_LONG,
    START_SECTION,
};
use serde::{Deserialize, Serialize};

const MAX_MESSAGE_LENGTH: usize = 0xFF_FFFF;
const NUMBER_OF_SUBSETS: &str = "numberOfSubsets";

const HEADER_KEYS: &[&str] = &[
    "edition",
    "masterTableNumber",
    "bufrHeaderCentre",
    "bufrHeaderSubCentre",
    "updateSequenceNumber",
    "dataCategory",
    "internationalDataSubCategory",
    "dataSubCategory",
    "masterTablesVersionNumber",
    "localTablesVersionNumber",
    "observedData",
    "compressedData",
    "unexpandedDescriptors",
];

/// Value of a single element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Missing,
    Long(i64),
    Double(f64),
    Longs(Vec<i64>),
    Text(String),
}

type Elements = Vec<(String, Value)>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Contents {
    header: Elements,
    subsets: Vec<Elements>,
}

#[derive(Debug, Clone)]
enum Body {
    Packed(Vec<u8>),
    Unpacked(Contents),
}

/// Handle to one keyed message.
#[derive(Debug, Clone)]
pub struct KeyedMessage {
    edition: u8,
    body: Body,
}

fn is_header_key(key: &str) -> bool {
    HEADER_KEYS.contains(&key) || key.starts_with("typical") || key.starts_with("input")
}

/// Data keys are stored with their rank, `latitude` is the same element as `#1#latitude`
fn data_key(key: &str) -> String {
    if key.starts_with('#') {
        key.to_owned()
    } else {
        format!("#1#{}", key)
    }
}

fn find(elements: &Elements, key: &str) -> Option<usize> {
    elements.iter().position(|(k, _)| k == key)
}

fn upsert(elements: &mut Elements, key: String, value: Value) {
    match find(elements, &key) {
        Some(i) => elements[i].1 = value,
        None => elements.push((key, value)),
    }
}

impl KeyedMessage {
    fn packed(edition: u8, body: Vec<u8>) -> Self {
        KeyedMessage {
            edition,
            body: Body::Packed(body),
        }
    }

    fn unpacked(contents: Contents) -> Self {
        KeyedMessage {
            edition: 4,
            body: Body::Unpacked(contents),
        }
    }

    fn contents(&self) -> Result<&Contents, CodecError> {
        match &self.body {
            Body::Unpacked(c) => Ok(c),
            Body::Packed(_) => Err(CodecError::NotUnpacked),
        }
    }

    fn contents_mut(&mut self) -> Result<&mut Contents, CodecError> {
        match &mut self.body {
            Body::Unpacked(c) => Ok(c),
            Body::Packed(_) => Err(CodecError::NotUnpacked),
        }
    }

    fn lookup(&self, key: &str) -> Result<Option<&Value>, CodecError> {
        let contents = self.contents()?;
        if is_header_key(key) {
            return Ok(find(&contents.header, key).map(|i| &contents.header[i].1));
        }

        let key = data_key(key);
        Ok(contents
            .subsets
            .first()
            .and_then(|s| find(s, &key).map(|i| &s[i].1)))
    }

    fn value(&self, key: &str) -> Result<&Value, CodecError> {
        self.lookup(key)?
            .ok_or_else(|| CodecError::KeyNotFound(key.to_owned()))
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), CodecError> {
        if is_header_key(key) {
            let contents = self.contents_mut()?;
            upsert(&mut contents.header, key.to_owned(), value);
            Ok(())
        } else {
            self.set_subset_value(1, key, value)
        }
    }

    /// Set a data element in subset `index` (1-based).
    pub fn set_subset_value(&mut self, index: usize, key: &str, value: Value) -> Result<(), CodecError> {
        let contents = self.contents_mut()?;
        if contents.subsets.is_empty() {
            contents.subsets.push(Elements::new());
        }

        let count = contents.subsets.len();
        let subset = index
            .checked_sub(1)
            .and_then(|i| contents.subsets.get_mut(i))
            .ok_or(CodecError::InvalidSubset { index, count })?;

        upsert(subset, data_key(key), value);
        Ok(())
    }
}

impl MessageHandle for KeyedMessage {
    fn unpack(&mut self) -> Result<(), CodecError> {
        if let Body::Packed(bytes) = &self.body {
            let contents: Contents =
                serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
            self.body = Body::Unpacked(contents);
        }

        Ok(())
    }

    fn has_key(&self, key: &str) -> bool {
        if key == NUMBER_OF_SUBSETS {
            return self.contents().is_ok();
        }

        matches!(self.lookup(key), Ok(Some(_)))
    }

    fn is_missing(&self, key: &str) -> Result<bool, CodecError> {
        Ok(matches!(self.value(key)?, Value::Missing))
    }

    fn get_long(&self, key: &str) -> Result<i64, CodecError> {
        if key == NUMBER_OF_SUBSETS {
            return Ok(self.subset_count()? as i64);
        }

        match self.value(key)? {
            Value::Missing => Ok(MISSING_LONG),
            Value::Long(v) => Ok(*v),
            Value::Double(v) => Ok(*v as i64),
            Value::Text(s) => s.trim().parse().map_err(|_| CodecError::WrongType {
                key: key.to_owned(),
                expected: "long",
            }),
            Value::Longs(_) => Err(CodecError::WrongType {
                key: key.to_owned(),
                expected: "long",
            }),
        }
    }

    fn get_double(&self, key: &str) -> Result<f64, CodecError> {
        match self.value(key)? {
            Value::Missing => Ok(MISSING_DOUBLE),
            Value::Long(v) => Ok(*v as f64),
            Value::Double(v) => Ok(*v),
            Value::Text(s) => s.trim().parse().map_err(|_| CodecError::WrongType {
                key: key.to_owned(),
                expected: "double",
            }),
            Value::Longs(_) => Err(CodecError::WrongType {
                key: key.to_owned(),
                expected: "double",
            }),
        }
    }

    fn get_string(&self, key: &str) -> Result<String, CodecError> {
        match self.value(key)? {
            Value::Missing => Ok(String::new()),
            Value::Long(v) => Ok(v.to_string()),
            Value::Double(v) => Ok(v.to_string()),
            Value::Text(s) => Ok(s.clone()),
            Value::Longs(_) => Err(CodecError::WrongType {
                key: key.to_owned(),
                expected: "string",
            }),
        }
    }

    fn get_long_array(&self, key: &str) -> Result<Vec<i64>, CodecError> {
        match self.value(key)? {
            Value::Missing => Ok(Vec::new()),
            Value::Long(v) => Ok(vec![*v]),
            Value::Longs(v) => Ok(v.clone()),
            _ => Err(CodecError::WrongType {
                key: key.to_owned(),
                expected: "long array",
            }),
        }
    }

    fn set_long(&mut self, key: &str, value: i64) -> Result<(), CodecError> {
        if key == NUMBER_OF_SUBSETS {
            let count = usize::try_from(value).map_err(|_| CodecError::WrongType {
                key: key.to_owned(),
                expected: "positive long",
            })?;
            self.contents_mut()?.subsets.resize_with(count, Elements::new);
            return Ok(());
        }

        self.set(key, Value::Long(value))
    }

    fn set_double(&mut self, key: &str, value: f64) -> Result<(), CodecError> {
        self.set(key, Value::Double(value))
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), CodecError> {
        self.set(key, Value::Text(value.to_owned()))
    }

    fn set_long_array(&mut self, key: &str, values: &[i64]) -> Result<(), CodecError> {
        self.set(key, Value::Longs(values.to_vec()))
    }

    fn set_missing(&mut self, key: &str) -> Result<(), CodecError> {
        self.set(key, Value::Missing)
    }

    fn subset_count(&self) -> Result<usize, CodecError> {
        Ok(self.contents()?.subsets.len())
    }

    fn extract_subset(&self, index: usize) -> Result<Self, CodecError> {
        let contents = self.contents()?;
        let count = contents.subsets.len();
        let subset = index
            .checked_sub(1)
            .and_then(|i| contents.subsets.get(i))
            .ok_or(CodecError::InvalidSubset { index, count })?;

        Ok(KeyedMessage {
            edition: self.edition,
            body: Body::Unpacked(Contents {
                header: contents.header.clone(),
                subsets: vec![subset.clone()],
            }),
        })
    }

    fn copy_data_to(&self, target: &mut Self) -> Result<(), CodecError> {
        let elements = self.contents()?.subsets.first().cloned().unwrap_or_default();
        for (key, value) in elements {
            target.set_subset_value(1, &key, value)?;
        }

        Ok(())
    }

    fn data_keys(&self) -> Result<Vec<String>, CodecError> {
        Ok(self
            .contents()?
            .subsets
            .first()
            .map(|s| s.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default())
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let (edition, body) = match &self.body {
            Body::Packed(bytes) => (self.edition, bytes.clone()),
            Body::Unpacked(contents) => {
                let edition = find(&contents.header, "edition")
                    .and_then(|i| match contents.header[i].1 {
                        Value::Long(v) => u8::try_from(v).ok(),
                        _ => None,
                    })
                    .unwrap_or(self.edition);
                let body = serde_json::to_vec(contents).map_err(|e| CodecError::Malformed(e.to_string()))?;
                (edition, body)
            }
        };

        let total = body.len() + FRAME_OVERHEAD;
        if total > MAX_MESSAGE_LENGTH {
            return Err(CodecError::TooLarge(total));
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(START_SECTION);
        out.extend_from_slice(&(total as u32).to_be_bytes()[1..]);
        out.push(edition);
        out.extend_from_slice(&body);
        out.extend_from_slice(END_SECTION);
        Ok(out)
    }
}

/// Codec for [`KeyedMessage`] streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedCodec;

impl KeyedCodec {
    pub fn new() -> Self {
        KeyedCodec
    }
}

impl BufrCodec for KeyedCodec {
    type Message = KeyedMessage;

    fn messages(&self, bytes: &[u8]) -> Vec<Result<KeyedMessage, CodecError>> {
        split_messages(bytes)
            .into_iter()
            .map(|frame| frame.map(|m| KeyedMessage::packed(m[7], m[8..m.len() - 4].to_vec())))
            .collect()
    }

    fn template(&self) -> Result<KeyedMessage, CodecError> {
        let header = vec![
            ("edition".to_owned(), Value::Long(4)),
            ("masterTableNumber".to_owned(), Value::Long(0)),
            ("bufrHeaderCentre".to_owned(), Value::Long(0)),
            ("bufrHeaderSubCentre".to_owned(), Value::Long(0)),
            ("updateSequenceNumber".to_owned(), Value::Long(0)),
            ("dataCategory".to_owned(), Value::Long(0)),
            ("internationalDataSubCategory".to_owned(), Value::Long(0)),
            ("dataSubCategory".to_owned(), Value::Long(0)),
            ("masterTablesVersionNumber".to_owned(), Value::Long(13)),
            ("localTablesVersionNumber".to_owned(), Value::Long(0)),
            ("observedData".to_owned(), Value::Long(1)),
            ("compressedData".to_owned(), Value::Long(0)),
            ("unexpandedDescriptors".to_owned(), Value::Longs(Vec::new())),
        ];

        Ok(KeyedMessage::unpacked(Contents {
            header,
            subsets: vec![Elements::new()],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KeyedMessage {
        let mut msg = KeyedCodec.template().unwrap();
        msg.set_long("masterTablesVersionNumber", 32).unwrap();
        msg.set_long("#1#blockNumber", 64).unwrap();
        msg.set_long("stationNumber", 400).unwrap();
        msg.set_double("#1#latitude", 13.35).unwrap();
        msg.set_missing("#1#longitude").unwrap();
        msg.set_string("#1#wigosLocalIdentifierCharacter", "64400").unwrap();
        msg
    }

    #[test]
    fn test_bare_key_is_first_rank() {
        let msg = sample();

        assert_eq!(400, msg.get_long("#1#stationNumber").unwrap());
        assert_eq!(64, msg.get_long("blockNumber").unwrap());
        assert!(msg.has_key("latitude"));
        assert!(!msg.has_key("#2#latitude"));
    }

    #[test]
    fn test_missing_values_return_sentinels() {
        let msg = sample();

        assert!(msg.is_missing("#1#longitude").unwrap());
        assert_eq!(MISSING_DOUBLE, msg.get_double("#1#longitude").unwrap());
        assert_eq!(MISSING_LONG, msg.get_long("#1#longitude").unwrap());
    }

    #[test]
    fn test_unknown_key() {
        let msg = sample();

        assert!(matches!(msg.get_long("#1#airTemperature"), Err(CodecError::KeyNotFound(_))));
    }

    #[test]
    fn test_encode_then_split_stream() {
        let first = sample().encode().unwrap();
        let second = KeyedCodec.template().unwrap().encode().unwrap();

        let mut stream = b"ISMD02 LIIB 210000 RRA\r\r\n".to_vec();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(b"\r\r\n");
        stream.extend_from_slice(&second);

        let messages = KeyedCodec.messages(&stream);
        assert_eq!(2, messages.len());

        let mut msg = messages.into_iter().next().unwrap().unwrap();
        assert!(matches!(msg.get_long("#1#blockNumber"), Err(CodecError::NotUnpacked)));

        msg.unpack().unwrap();
        assert_eq!(32, msg.get_long("masterTablesVersionNumber").unwrap());
        assert_eq!("64400", msg.get_string("#1#wigosLocalIdentifierCharacter").unwrap());
    }

    #[test]
    fn test_truncated_stream() {
        let mut bytes = sample().encode().unwrap();
        bytes.truncate(bytes.len() - 10);

        let messages = KeyedCodec.messages(&bytes);
        assert_eq!(1, messages.len());
        assert!(matches!(messages[0], Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_missing_end_section() {
        let mut bytes = sample().encode().unwrap();
        let len = bytes.len();
        bytes[len - 1] = b'X';

        let messages = KeyedCodec.messages(&bytes);
        assert!(matches!(messages[0], Err(CodecError::MissingEndSection { offset: 0 })));
    }

    #[test]
    fn test_unpack_malformed_body() {
        let body = b"not json";
        let mut bytes = b"BUFR".to_vec();
        bytes.extend_from_slice(&((body.len() + 12) as u32).to_be_bytes()[1..]);
        bytes.push(4);
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(b"7777");

        let mut msg = KeyedCodec.messages(&bytes).into_iter().next().unwrap().unwrap();
        assert!(matches!(msg.unpack(), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_extract_subset() {
        let mut msg = KeyedCodec.template().unwrap();
        msg.set_long("numberOfSubsets", 2).unwrap();
        msg.set_subset_value(1, "#1#stationNumber", Value::Long(1)).unwrap();
        msg.set_subset_value(2, "#1#stationNumber", Value::Long(2)).unwrap();

        assert_eq!(2, msg.get_long("numberOfSubsets").unwrap());

        let second = msg.extract_subset(2).unwrap();
        assert_eq!(1, second.subset_count().unwrap());
        assert_eq!(2, second.get_long("stationNumber").unwrap());
        assert!(matches!(
            msg.extract_subset(3),
            Err(CodecError::InvalidSubset { index: 3, count: 2 })
        ));
    }

    #[test]
    fn test_copy_data_keeps_target_header() {
        let source = sample();
        let mut target = KeyedCodec.template().unwrap();
        target.set_long_array("unexpandedDescriptors", &[301150, 307080]).unwrap();
        source.copy_data_to(&mut target).unwrap();

        assert_eq!(13, target.get_long("masterTablesVersionNumber").unwrap());
        assert_eq!(vec![301150, 307080], target.get_long_array("unexpandedDescriptors").unwrap());
        assert_eq!(source.data_keys().unwrap(), target.data_keys().unwrap());
    }
}
