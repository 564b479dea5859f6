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

//! Split BUFR messages into one re-encoded BUFR4 message per subset.
//!
//! Each subset goes through the same steps: read the candidate station identifiers,
//! location and time, resolve the station against the [`StationDirectory`], then write
//! the subset into a fresh BUFR4 template carrying the resolved WIGOS identifier and,
//! when the subset had no usable location, the coordinates recorded for the station.
//!
//! Every subset produces exactly one [`Outcome`]. A message that can't be unpacked
//! produces a single rejected outcome and the next message in the stream is processed.

pub mod extract;

use crate::codec::{long_value, BufrCodec, CodecError, MessageHandle, WIGOS_SEQUENCE};
use crate::outcome::{wigos_identifier, DataFormat, ItemMetadata, Outcome, PointGeometry};
use crate::station::StationDirectory;
use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

pub use extract::{StationIdentity, TimeError};

/// Lowest master table version written to output messages
pub const MIN_TABLE_VERSION: i64 = 28;

const COPIED_HEADER_KEYS: &[&str] = &[
    "edition",
    "masterTableNumber",
    "bufrHeaderCentre",
    "bufrHeaderSubCentre",
    "updateSequenceNumber",
    "dataCategory",
    "internationalDataSubCategory",
    "dataSubCategory",
    "localTablesVersionNumber",
    "observedData",
];

const REPLICATION_FACTORS: &[(&str, &str)] = &[
    (
        "shortDelayedDescriptorReplicationFactor",
        "inputShortDelayedDescriptorReplicationFactor",
    ),
    (
        "delayedDescriptorReplicationFactor",
        "inputDelayedDescriptorReplicationFactor",
    ),
    (
        "extendedDelayedDescriptorReplicationFactor",
        "inputExtendedDelayedDescriptorReplicationFactor",
    ),
];

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid WIGOS station identifier {0}")]
    InvalidIdentifier(String),
}

/// Write the four parts of `wsi` to the WIGOS identification elements of `msg`.
pub fn set_wigos_identifier<M: MessageHandle>(msg: &mut M, wsi: &str) -> Result<(), EncodeError> {
    let invalid = || EncodeError::InvalidIdentifier(wsi.to_owned());
    let parts: Vec<&str> = wsi.splitn(4, '-').collect();
    let [series, issuer, number, local] = parts.as_slice() else {
        return Err(invalid());
    };

    msg.set_long("#1#wigosIdentifierSeries", series.parse().map_err(|_| invalid())?)?;
    msg.set_long("#1#wigosIssuerOfIdentifier", issuer.parse().map_err(|_| invalid())?)?;
    msg.set_long("#1#wigosIssueNumber", number.parse().map_err(|_| invalid())?)?;
    msg.set_string("#1#wigosLocalIdentifierCharacter", local)?;
    Ok(())
}

/// Set the typical date and time header elements to `date`.
pub fn set_typical_time<M: MessageHandle>(msg: &mut M, date: &DateTime<Utc>) -> Result<(), CodecError> {
    msg.set_long("typicalYear", i64::from(date.year()))?;
    msg.set_long("typicalMonth", i64::from(date.month()))?;
    msg.set_long("typicalDay", i64::from(date.day()))?;
    msg.set_long("typicalHour", i64::from(date.hour()))?;
    msg.set_long("typicalMinute", i64::from(date.minute()))?;
    msg.set_long("typicalSecond", i64::from(date.second()))?;
    Ok(())
}

/// Header values shared by every subset of one message.
#[derive(Debug, Clone, PartialEq)]
struct MessageHeader {
    table_version: i64,
    descriptors: Vec<i64>,
}

impl MessageHeader {
    fn read<M: MessageHandle>(msg: &M) -> Result<Self, CodecError> {
        let table_version = msg.get_long("masterTablesVersionNumber")?.max(MIN_TABLE_VERSION);
        let mut descriptors = msg.get_long_array("unexpandedDescriptors")?;
        if !descriptors.contains(&WIGOS_SEQUENCE) {
            descriptors.insert(0, WIGOS_SEQUENCE);
        }

        Ok(MessageHeader {
            table_version,
            descriptors,
        })
    }
}

/// Write the resolved identity, repaired location and time of one subset.
struct SubsetUpdate<'a> {
    wsi: &'a str,
    repaired: Option<PointGeometry>,
    data_date: DateTime<Utc>,
}

pub struct BufrTransformer<'a, C: BufrCodec> {
    codec: &'a C,
    stations: &'a StationDirectory,
}

impl<'a, C: BufrCodec> BufrTransformer<'a, C> {
    pub fn new(codec: &'a C, stations: &'a StationDirectory) -> Self {
        BufrTransformer { codec, stations }
    }

    /// Transform every message in `bytes`, in stream order.
    pub fn transform(&self, bytes: &[u8]) -> Vec<Outcome> {
        let messages = self.codec.messages(bytes);
        if messages.is_empty() {
            return vec![Outcome::rejected("No BUFR messages found in input")];
        }

        let mut outcomes = Vec::new();
        for (index, message) in messages.into_iter().enumerate() {
            let unpacked = message.and_then(|mut msg| msg.unpack().map(|_| msg));
            match unpacked {
                Ok(msg) => outcomes.extend(self.transform_message(&msg)),
                Err(e) => {
                    tracing::error!(message = "error unpacking message", index = index, error = %e);
                    outcomes.push(Outcome::rejected(format!("error unpacking message: {}", e)));
                }
            }
        }

        outcomes
    }

    fn transform_message(&self, msg: &C::Message) -> Vec<Outcome> {
        let header = match MessageHeader::read(msg) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(message = "error reading message header", error = %e);
                return vec![Outcome::rejected(format!("error unpacking message: {}", e))];
            }
        };

        let count = match msg.subset_count() {
            Ok(c) => c,
            Err(e) => return vec![Outcome::rejected(format!("error unpacking message: {}", e))],
        };

        tracing::debug!(message = "found subsets", count = count);
        (1..=count)
            .map(|index| self.transform_subset(msg, &header, index))
            .collect()
    }

    fn transform_subset(&self, msg: &C::Message, header: &MessageHeader, index: usize) -> Outcome {
        tracing::debug!(message = "processing subset", index = index);

        let subset = match msg.extract_subset(index) {
            Ok(s) => s,
            Err(e) => return Outcome::rejected(format!("Error processing subset: {}", e)),
        };

        let candidate = extract::identity(&subset);
        let location = extract::location(&subset);
        let data_date = match extract::observation_time(&subset) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(message = "error extracting time", index = index, error = %e);
                return Outcome::rejected(format!("Error extracting time: {}", e));
            }
        };

        let wsi = match self
            .stations
            .resolve(candidate.wsi.as_deref(), candidate.tsi.as_deref())
        {
            Some(w) => w,
            None => {
                let wsi = candidate.wsi.as_deref().unwrap_or("None");
                let tsi = candidate.tsi.as_deref().unwrap_or("None");
                tracing::error!(message = "station not in station list", wsi = %wsi, tsi = %tsi);
                return Outcome::rejected(format!(
                    "Station not in station list: wsi={} tsi={}; skipping",
                    wsi, tsi
                ));
            }
        };

        let mut warnings = Vec::new();
        let (geometry, repaired) = match location {
            Some(g) => (Some(g), None),
            None => {
                let recorded = self.stations.geometry_of(wsi);
                tracing::warn!(message = "missing coordinates, using station metadata", wsi = %wsi);
                warnings.push(format!(
                    "Missing coordinates for station {}; using coordinates from station metadata",
                    wsi
                ));
                (recorded, recorded)
            }
        };

        let update = SubsetUpdate {
            wsi,
            repaired,
            data_date,
        };

        let outcome = match self.encode_subset(msg, &subset, header, &update) {
            Ok(bytes) => {
                let identifier = wigos_identifier(wsi, &data_date);
                tracing::info!(message = "transformed subset", identifier = %identifier);
                Outcome::emitted(
                    DataFormat::Bufr4,
                    bytes,
                    ItemMetadata {
                        identifier,
                        wigos_station_identifier: Some(wsi.to_owned()),
                        data_date,
                        geometry,
                        status: None,
                    },
                )
            }
            Err(e) => {
                tracing::error!(message = "error processing subset", index = index, error = %e);
                Outcome::rejected(format!("Error processing subset: {}", e))
            }
        };

        outcome.with_warnings(warnings)
    }

    fn encode_subset(
        &self,
        msg: &C::Message,
        subset: &C::Message,
        header: &MessageHeader,
        update: &SubsetUpdate<'_>,
    ) -> Result<Vec<u8>, EncodeError> {
        let mut out = self.codec.template()?;

        for key in COPIED_HEADER_KEYS {
            if let Some(v) = long_value(msg, key) {
                out.set_long(key, v)?;
            }
        }

        for (source, target) in REPLICATION_FACTORS {
            if subset.has_key(source) {
                let factors = subset.get_long_array(source).unwrap_or_default();
                out.set_long_array(target, &factors)?;
            }
        }

        out.set_long("masterTablesVersionNumber", header.table_version)?;
        out.set_long_array("unexpandedDescriptors", &header.descriptors)?;
        subset.copy_data_to(&mut out)?;

        set_wigos_identifier(&mut out, update.wsi)?;

        if let Some(g) = update.repaired {
            out.set_double("#1#longitude", g.longitude)?;
            out.set_double("#1#latitude", g.latitude)?;
            match g.elevation {
                Some(e) => out.set_double("#1#heightOfStationGroundAboveMeanSeaLevel", e)?,
                None => out.set_missing("#1#heightOfStationGroundAboveMeanSeaLevel")?,
            }
        }

        set_typical_time(&mut out, &update.data_date)?;
        Ok(out.encode()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::keyed::{KeyedCodec, KeyedMessage, Value};
    use crate::outcome::Emitted;
    use crate::station::tests::station;
    use chrono::TimeZone;

    fn directory() -> StationDirectory {
        StationDirectory::new(vec![
            station(
                "0-20000-0-64400",
                Some("64400"),
                PointGeometry::new(11.9, -4.82, Some(16.0)),
                &[],
            ),
            station(
                "0-454-2-AWSBALAKA",
                Some("AWSBALAKA"),
                PointGeometry::new(34.96, -14.98, Some(618.0)),
                &[],
            ),
        ])
    }

    fn source() -> KeyedMessage {
        let mut msg = KeyedCodec.template().unwrap();
        msg.set_long("masterTablesVersionNumber", 13).unwrap();
        msg.set_long("dataCategory", 0).unwrap();
        msg.set_long("internationalDataSubCategory", 2).unwrap();
        msg.set_long_array("unexpandedDescriptors", &[307080]).unwrap();
        msg
    }

    fn set_subset(msg: &mut KeyedMessage, index: usize, values: &[(&str, Value)]) {
        for (key, value) in values {
            msg.set_subset_value(index, key, value.clone()).unwrap();
        }
    }

    fn observation(block: i64, station: i64, located: bool) -> Vec<(&'static str, Value)> {
        let mut values = vec![
            ("#1#blockNumber", Value::Long(block)),
            ("#1#stationNumber", Value::Long(station)),
            ("#1#year", Value::Long(2023)),
            ("#1#month", Value::Long(1)),
            ("#1#day", Value::Long(19)),
            ("#1#hour", Value::Long(6)),
            ("#1#minute", Value::Long(0)),
            ("#1#airTemperature", Value::Double(283.35)),
        ];

        if located {
            values.push(("#1#latitude", Value::Double(-4.8)));
            values.push(("#1#longitude", Value::Double(11.85)));
        } else {
            values.push(("#1#latitude", Value::Missing));
            values.push(("#1#longitude", Value::Missing));
        }

        values
    }

    fn decode(bytes: &[u8]) -> KeyedMessage {
        let mut msg = KeyedCodec.messages(bytes).into_iter().next().unwrap().unwrap();
        msg.unpack().unwrap();
        msg
    }

    fn emitted(outcome: &Outcome) -> &Emitted {
        match outcome {
            Outcome::Emitted(e) => e,
            Outcome::Rejected(d) => panic!("unexpected rejection: {:?}", d),
        }
    }

    #[test]
    fn test_transform_single_subset() {
        let mut msg = source();
        set_subset(&mut msg, 1, &observation(64, 400, true));
        let bytes = msg.encode().unwrap();

        let stations = directory();
        let outcomes = BufrTransformer::new(&KeyedCodec, &stations).transform(&bytes);
        assert_eq!(1, outcomes.len());

        let item = emitted(&outcomes[0]);
        assert!(item.diagnostics.is_empty());
        assert_eq!("WIGOS_0-20000-0-64400_20230119T060000", item.meta.identifier);
        assert_eq!(Some("0-20000-0-64400"), item.meta.wigos_station_identifier.as_deref());
        assert_eq!(Utc.with_ymd_and_hms(2023, 1, 19, 6, 0, 0).unwrap(), item.meta.data_date);
        assert_eq!(Some(PointGeometry::new(11.85, -4.8, None)), item.meta.geometry);

        let out = decode(item.payloads[0].data.as_ref().unwrap());
        assert_eq!(MIN_TABLE_VERSION, out.get_long("masterTablesVersionNumber").unwrap());
        assert_eq!(vec![301150, 307080], out.get_long_array("unexpandedDescriptors").unwrap());
        assert_eq!(2, out.get_long("internationalDataSubCategory").unwrap());
        assert_eq!(20000, out.get_long("#1#wigosIssuerOfIdentifier").unwrap());
        assert_eq!("64400", out.get_string("#1#wigosLocalIdentifierCharacter").unwrap());
        assert_eq!(283.35, out.get_double("#1#airTemperature").unwrap());
        assert_eq!(2023, out.get_long("typicalYear").unwrap());
        assert_eq!(6, out.get_long("typicalHour").unwrap());
        assert_eq!(0, out.get_long("typicalSecond").unwrap());
    }

    #[test]
    fn test_table_version_not_lowered() {
        let mut msg = source();
        msg.set_long("masterTablesVersionNumber", 33).unwrap();
        msg.set_long_array("unexpandedDescriptors", &[301150, 307080]).unwrap();
        set_subset(&mut msg, 1, &observation(64, 400, true));

        let stations = directory();
        let outcomes = BufrTransformer::new(&KeyedCodec, &stations).transform(&msg.encode().unwrap());
        let out = decode(emitted(&outcomes[0]).payloads[0].data.as_ref().unwrap());

        assert_eq!(33, out.get_long("masterTablesVersionNumber").unwrap());
        assert_eq!(vec![301150, 307080], out.get_long_array("unexpandedDescriptors").unwrap());
    }

    #[test]
    fn test_repair_missing_location() {
        let mut msg = source();
        set_subset(&mut msg, 1, &observation(64, 400, false));
        let bytes = msg.encode().unwrap();

        let stations = directory();
        let transformer = BufrTransformer::new(&KeyedCodec, &stations);
        let first = transformer.transform(&bytes);
        let second = transformer.transform(&bytes);

        let item = emitted(&first[0]);
        let expected = PointGeometry::new(11.9, -4.82, Some(16.0));
        assert_eq!(Some(expected), item.meta.geometry);
        assert_eq!(1, item.diagnostics.warnings.len());
        assert!(item.diagnostics.warnings[0].contains("using coordinates from station metadata"));

        let out = decode(item.payloads[0].data.as_ref().unwrap());
        assert_eq!(-4.82, out.get_double("#1#latitude").unwrap());
        assert_eq!(11.9, out.get_double("#1#longitude").unwrap());
        assert_eq!(16.0, out.get_double("#1#heightOfStationGroundAboveMeanSeaLevel").unwrap());

        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_station_rejected() {
        let mut msg = source();
        set_subset(&mut msg, 1, &observation(99, 999, true));

        let stations = directory();
        let outcomes = BufrTransformer::new(&KeyedCodec, &stations).transform(&msg.encode().unwrap());

        assert_eq!(
            vec![Outcome::rejected(
                "Station not in station list: wsi=None tsi=99999; skipping"
            )],
            outcomes
        );
    }

    #[test]
    fn test_wigos_identifier_wins_over_traditional() {
        let mut msg = source();
        let mut values = observation(64, 400, true);
        values.push(("#1#wigosIdentifierSeries", Value::Long(0)));
        values.push(("#1#wigosIssuerOfIdentifier", Value::Long(454)));
        values.push(("#1#wigosIssueNumber", Value::Long(2)));
        values.push(("#1#wigosLocalIdentifierCharacter", Value::Text("AWSBALAKA".to_owned())));
        set_subset(&mut msg, 1, &values);

        let stations = directory();
        let outcomes = BufrTransformer::new(&KeyedCodec, &stations).transform(&msg.encode().unwrap());

        assert_eq!(
            Some("0-454-2-AWSBALAKA"),
            emitted(&outcomes[0]).meta.wigos_station_identifier.as_deref()
        );
    }

    #[test]
    fn test_one_outcome_per_subset() {
        let mut msg = source();
        msg.set_long("numberOfSubsets", 3).unwrap();
        set_subset(&mut msg, 1, &observation(64, 400, true));
        set_subset(&mut msg, 2, &observation(99, 999, true));
        let mut no_time = observation(64, 400, true);
        no_time.retain(|(k, _)| *k != "#1#day");
        set_subset(&mut msg, 3, &no_time);

        let stations = directory();
        let outcomes = BufrTransformer::new(&KeyedCodec, &stations).transform(&msg.encode().unwrap());

        assert_eq!(3, outcomes.len());
        assert!(outcomes[0].is_emitted());
        assert!(outcomes[1].diagnostics().errors[0].contains("not in station list"));
        assert_eq!(
            vec!["Error extracting time: missing day".to_owned()],
            outcomes[2].diagnostics().errors
        );
    }

    #[test]
    fn test_replication_factors_copied_when_present() {
        let mut msg = source();
        let mut values = observation(64, 400, true);
        values.push(("delayedDescriptorReplicationFactor", Value::Longs(vec![1, 2])));
        set_subset(&mut msg, 1, &values);

        let stations = directory();
        let outcomes = BufrTransformer::new(&KeyedCodec, &stations).transform(&msg.encode().unwrap());
        let out = decode(emitted(&outcomes[0]).payloads[0].data.as_ref().unwrap());

        assert_eq!(
            vec![1, 2],
            out.get_long_array("inputDelayedDescriptorReplicationFactor").unwrap()
        );
        assert!(!out.has_key("inputShortDelayedDescriptorReplicationFactor"));
    }

    #[test]
    fn test_unpack_failure_continues_with_next_message() {
        let body = b"{broken";
        let mut bytes = b"BUFR".to_vec();
        bytes.extend_from_slice(&((body.len() + 12) as u32).to_be_bytes()[1..]);
        bytes.push(4);
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(b"7777");

        let mut msg = source();
        set_subset(&mut msg, 1, &observation(64, 400, true));
        bytes.extend_from_slice(&msg.encode().unwrap());

        let stations = directory();
        let outcomes = BufrTransformer::new(&KeyedCodec, &stations).transform(&bytes);

        assert_eq!(2, outcomes.len());
        assert!(outcomes[0].diagnostics().errors[0].starts_with("error unpacking message"));
        assert!(outcomes[1].is_emitted());
    }

    #[test]
    fn test_no_messages() {
        let stations = directory();
        let outcomes = BufrTransformer::new(&KeyedCodec, &stations).transform(b"not bufr at all");

        assert_eq!(1, outcomes.len());
        assert!(!outcomes[0].is_emitted());
    }
}
