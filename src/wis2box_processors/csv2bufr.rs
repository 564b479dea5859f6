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

//! Convert delimited rows to BUFR4 using a mapping from columns to BUFR keys.
//!
//! A mapping lists header and data entries, each naming the key to set and where
//! the value comes from:
//!
//! * `data:<column>` the value of a column of the current row
//! * `const:<value>` a literal value
//! * `array:<v1>, <v2>, ...` a list of integers, e.g. unexpanded descriptors
//!
//! Data entries can carry `scale` and `offset` (applied as `value * 10^scale + offset`)
//! and a `valid_min` / `valid_max` range. Values outside of the range are encoded
//! as missing and reported as a warning.

use crate::bufr::extract::{identity, location, observation_time};
use crate::codec::{BufrCodec, CodecError, MessageHandle};
use crate::outcome::{wigos_identifier, DataFormat, Diagnostics, ItemMetadata, Outcome, PointGeometry};
use crate::station::StationDirectory;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_TEMPLATE: &str = "aws-template";

const TEMPLATES: &[(&str, &str)] = &[(DEFAULT_TEMPLATE, include_str!("templates/aws-template.json"))];

/// Replication factor keys, set before any other key of a message
const REPLICATION_FACTORS: &[&str] = &[
    "inputShortDelayedDescriptorReplicationFactor",
    "inputDelayedDescriptorReplicationFactor",
    "inputExtendedDelayedDescriptorReplicationFactor",
];

const ELEVATION: &str = "#1#heightOfStationGroundAboveMeanSeaLevel";

/// Parts of a `wsi` column, in order
const WSI_COLUMNS: [&str; 4] = ["wsi_series", "wsi_issuer", "wsi_issue_number", "wsi_local"];

#[derive(Debug, Error)]
pub enum Csv2BufrError {
    #[error("Unknown template: {0}, options are: {1}")]
    UnknownTemplate(String, String),

    #[error("Invalid mapping: {0}")]
    InvalidMapping(#[from] serde_json::Error),

    #[error("Invalid delimiter {0:?}, must be a single ASCII character")]
    InvalidDelimiter(String),

    #[error("Error reading CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("No column names found in row {0}")]
    MissingColumnNames(usize),
}

fn template_names() -> Vec<&'static str> {
    TEMPLATES.iter().map(|(name, _)| *name).collect()
}

/// Where the value of a key comes from
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub enum Source {
    Data(String),
    Const(String),
    Array(Vec<i64>),
}

impl TryFrom<String> for Source {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (kind, rest) = value
            .split_once(':')
            .ok_or_else(|| format!("invalid value {:?}, expected data:, const: or array:", value))?;

        match kind {
            "data" => Ok(Source::Data(rest.trim().to_owned())),
            "const" => Ok(Source::Const(rest.trim().to_owned())),
            "array" => rest
                .split(',')
                .map(|v| v.trim().parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map(Source::Array)
                .map_err(|e| format!("invalid array {:?}: {}", rest, e)),
            _ => Err(format!("invalid value {:?}, expected data:, const: or array:", value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MappingEntry {
    pub eccodes_key: String,
    pub value: Source,
    #[serde(default)]
    pub valid_min: Option<f64>,
    #[serde(default)]
    pub valid_max: Option<f64>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
}

fn one() -> usize {
    1
}

fn comma() -> String {
    ",".to_owned()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Mapping {
    #[serde(default, rename = "inputShortDelayedDescriptorReplicationFactor")]
    pub short_replication: Vec<i64>,
    #[serde(default, rename = "inputDelayedDescriptorReplicationFactor")]
    pub replication: Vec<i64>,
    #[serde(default, rename = "inputExtendedDelayedDescriptorReplicationFactor")]
    pub extended_replication: Vec<i64>,
    #[serde(default = "one")]
    pub number_header_rows: usize,
    #[serde(default = "one")]
    pub column_names_row: usize,
    #[serde(default = "comma")]
    pub delimiter: String,
    #[serde(default)]
    pub header: Vec<MappingEntry>,
    pub data: Vec<MappingEntry>,
}

impl Mapping {
    /// Load one of the built-in mappings by name.
    pub fn template(name: &str) -> Result<Mapping, Csv2BufrError> {
        let name = name.trim_end_matches(".json").replace('_', "-");
        let json = TEMPLATES
            .iter()
            .find(|(n, _)| *n == name || n.replace("template", "mappings") == name)
            .map(|(_, json)| *json)
            .ok_or_else(|| Csv2BufrError::UnknownTemplate(name.clone(), template_names().join(", ")))?;

        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Mapping, Csv2BufrError> {
        Ok(serde_json::from_value(value)?)
    }

    fn delimiter_byte(&self) -> Result<u8, Csv2BufrError> {
        match self.delimiter.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(Csv2BufrError::InvalidDelimiter(self.delimiter.clone())),
        }
    }

    fn replication_factors(&self) -> [(&'static str, &[i64]); 3] {
        [
            (REPLICATION_FACTORS[0], self.short_replication.as_slice()),
            (REPLICATION_FACTORS[1], self.replication.as_slice()),
            (REPLICATION_FACTORS[2], self.extended_replication.as_slice()),
        ]
    }
}

/// A typed cell or constant
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Long(i64),
    Double(f64),
    Text(String),
}

impl Cell {
    /// Integers first, then floating point, anything else is text. Blank means missing.
    fn parse(raw: &str) -> Option<Cell> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Ok(v) = raw.parse::<i64>() {
            Some(Cell::Long(v))
        } else if let Ok(v) = raw.parse::<f64>() {
            Some(Cell::Double(v))
        } else {
            Some(Cell::Text(raw.to_owned()))
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            Cell::Long(v) => Some(*v as f64),
            Cell::Double(v) => Some(*v),
            Cell::Text(_) => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Long(v) => write!(f, "{}", v),
            Cell::Double(v) => write!(f, "{}", v),
            Cell::Text(v) => f.write_str(v),
        }
    }
}

fn scaled(cell: Cell, entry: &MappingEntry) -> Cell {
    if entry.scale.is_none() && entry.offset.is_none() {
        return cell;
    }

    match cell.number() {
        Some(v) => {
            let scale = entry.scale.unwrap_or(0.0);
            let offset = entry.offset.unwrap_or(0.0);
            Cell::Double(v * 10f64.powf(scale) + offset)
        }
        None => cell,
    }
}

fn out_of_range(cell: &Cell, entry: &MappingEntry) -> Option<String> {
    let v = cell.number()?;
    let below = entry.valid_min.map(|min| v < min).unwrap_or(false);
    let above = entry.valid_max.map(|max| v > max).unwrap_or(false);
    if !(below || above) {
        return None;
    }

    let bound = |b: Option<f64>| b.map(|b| b.to_string()).unwrap_or_else(|| "-".to_owned());
    Some(format!(
        "{}: Value ({}) out of valid range ({} - {}).; Element set to missing",
        entry.eccodes_key,
        cell,
        bound(entry.valid_min),
        bound(entry.valid_max)
    ))
}

fn set_cell<M: MessageHandle>(msg: &mut M, key: &str, cell: &Cell) -> Result<(), CodecError> {
    match cell {
        Cell::Long(v) => msg.set_long(key, *v),
        Cell::Double(v) => msg.set_double(key, *v),
        Cell::Text(v) => msg.set_string(key, v),
    }
}

/// Values of one row by column name
type Row = HashMap<String, String>;

fn split_wsi(row: &mut Row) {
    let parts: Vec<String> = match row.get("wsi") {
        Some(wsi) => wsi.split('-').map(str::to_owned).collect(),
        None => return,
    };

    if parts.len() == WSI_COLUMNS.len() {
        for (column, part) in WSI_COLUMNS.iter().zip(parts) {
            row.entry((*column).to_owned()).or_insert(part);
        }
    }
}

/// Write a location from station metadata. An elevation the station record lacks
/// is written as missing so the message never keeps part of the observed location.
fn set_location<M: MessageHandle>(msg: &mut M, geometry: &PointGeometry) -> Result<(), CodecError> {
    msg.set_double("#1#latitude", geometry.latitude)?;
    msg.set_double("#1#longitude", geometry.longitude)?;
    match geometry.elevation {
        Some(e) => msg.set_double(ELEVATION, e),
        None => msg.set_missing(ELEVATION),
    }
}

pub struct Csv2BufrTransformer<'a, C: BufrCodec> {
    codec: &'a C,
    stations: &'a StationDirectory,
    mapping: &'a Mapping,
}

impl<'a, C: BufrCodec> Csv2BufrTransformer<'a, C> {
    pub fn new(codec: &'a C, stations: &'a StationDirectory, mapping: &'a Mapping) -> Self {
        Csv2BufrTransformer {
            codec,
            stations,
            mapping,
        }
    }

    /// Convert every data row of `data`, one outcome per row.
    pub fn transform(&self, data: &str) -> Result<Vec<Outcome>, Csv2BufrError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.mapping.delimiter_byte()?)
            .from_reader(data.as_bytes());

        let records = reader.records().collect::<Result<Vec<_>, _>>()?;
        let names: Vec<String> = self
            .mapping
            .column_names_row
            .checked_sub(1)
            .and_then(|i| records.get(i))
            .ok_or(Csv2BufrError::MissingColumnNames(self.mapping.column_names_row))?
            .iter()
            .map(|s| s.trim().to_owned())
            .collect();

        tracing::debug!(
            message = "converting CSV rows",
            rows = records.len().saturating_sub(self.mapping.number_header_rows)
        );

        Ok(records
            .iter()
            .enumerate()
            .skip(self.mapping.number_header_rows)
            .map(|(i, record)| {
                let line = i + 1;
                if record.len() != names.len() {
                    return Outcome::rejected(format!(
                        "Row {}: expected {} columns, found {}",
                        line,
                        names.len(),
                        record.len()
                    ));
                }

                let mut row: Row = names.iter().cloned().zip(record.iter().map(str::to_owned)).collect();
                split_wsi(&mut row);
                self.transform_row(line, &row)
            })
            .collect())
    }

    fn transform_row(&self, line: usize, row: &Row) -> Outcome {
        let mut msg = match self.codec.template() {
            Ok(m) => m,
            Err(e) => return Outcome::rejected(format!("Error processing row {}: {}", line, e)),
        };
        let mut warnings = Vec::new();

        if let Err(e) = self.apply_mapping(&mut msg, row, &mut warnings) {
            return Outcome::rejected(format!("Error processing row {}: {}", line, e)).with_warnings(warnings);
        }

        let wsi = match identity(&msg).wsi {
            Some(wsi) => wsi,
            None => {
                return Outcome::rejected(format!("Missing WIGOS station identifier in row {}", line))
                    .with_warnings(warnings)
            }
        };

        if !self.stations.contains(&wsi) {
            tracing::warn!(message = "station not in station list", wsi = %wsi);
            return Outcome::Rejected(Diagnostics::warning(format!(
                "Station {} not in station list; skipping",
                wsi
            )))
            .with_warnings(warnings);
        }

        let data_date = match observation_time(&msg) {
            Ok(d) => d,
            Err(e) => return Outcome::rejected(format!("Error extracting time: {}", e)).with_warnings(warnings),
        };

        let geometry = match location(&msg) {
            Some(g) => Some(g),
            None => {
                let repaired = self.stations.geometry_of(&wsi);
                if let Some(g) = &repaired {
                    warnings.push(format!(
                        "Missing coordinates for station {}; using coordinates from station metadata",
                        wsi
                    ));
                    if let Err(e) = set_location(&mut msg, g) {
                        return Outcome::rejected(format!("Error processing row {}: {}", line, e))
                            .with_warnings(warnings);
                    }
                }
                repaired
            }
        };

        match msg.encode() {
            Ok(bytes) => Outcome::emitted(
                DataFormat::Bufr4,
                bytes,
                ItemMetadata {
                    identifier: wigos_identifier(&wsi, &data_date),
                    wigos_station_identifier: Some(wsi),
                    data_date,
                    geometry,
                    status: None,
                },
            )
            .with_warnings(warnings),
            Err(e) => Outcome::rejected(format!("Error encoding row {}: {}", line, e)).with_warnings(warnings),
        }
    }

    fn apply_mapping<M: MessageHandle>(
        &self,
        msg: &mut M,
        row: &Row,
        warnings: &mut Vec<String>,
    ) -> Result<(), CodecError> {
        for (key, factors) in self.mapping.replication_factors() {
            if !factors.is_empty() {
                msg.set_long_array(key, factors)?;
            }
        }

        for entry in &self.mapping.header {
            self.apply_entry(msg, entry, row, warnings, false)?;
        }

        for entry in &self.mapping.data {
            self.apply_entry(msg, entry, row, warnings, true)?;
        }

        Ok(())
    }

    fn apply_entry<M: MessageHandle>(
        &self,
        msg: &mut M,
        entry: &MappingEntry,
        row: &Row,
        warnings: &mut Vec<String>,
        is_data: bool,
    ) -> Result<(), CodecError> {
        let key = entry.eccodes_key.as_str();
        let cell = match &entry.value {
            Source::Array(values) => return msg.set_long_array(key, values),
            Source::Const(v) => Cell::parse(v),
            Source::Data(column) => row.get(column).and_then(|v| Cell::parse(v)),
        };

        let cell = match cell {
            Some(c) => scaled(c, entry),
            None if is_data => return msg.set_missing(key),
            None => return Ok(()),
        };

        if let Some(warning) = out_of_range(&cell, entry) {
            tracing::debug!(message = "value out of range", key = key, value = %cell);
            warnings.push(warning);
            return msg.set_missing(key);
        }

        set_cell(msg, key, &cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::keyed::KeyedCodec;
    use crate::codec::{double_value, long_value};
    use crate::outcome::{Emitted, PointGeometry};
    use crate::station::tests::station;

    const COLUMNS: &str = "wsi_series,wsi_issuer,wsi_issue_number,wsi_local,wmo_block_number,wmo_station_number,station_type,year,month,day,hour,minute,latitude,longitude,station_height_above_msl,barometer_height_above_msl,station_pressure,msl_pressure,air_temperature";

    fn csv(wsi_local: &str, latitude: &str, msl_pressure: &str) -> String {
        format!(
            "{}\n0,20000,0,{},15,15,1,2022,3,31,0,0,{},23.94046026,503,504.43,100940,{},298.15\n",
            COLUMNS, wsi_local, latitude, msl_pressure
        )
    }

    fn stations() -> StationDirectory {
        StationDirectory::new(vec![station(
            "0-20000-0-15015",
            Some("15015"),
            PointGeometry::new(23.94, 47.77, Some(503.0)),
            &["csv/test"],
        )])
    }

    fn emitted(outcome: &Outcome) -> &Emitted {
        match outcome {
            Outcome::Emitted(e) => e,
            Outcome::Rejected(d) => panic!("unexpected rejection: {:?}", d),
        }
    }

    fn decoded(item: &Emitted) -> crate::codec::keyed::KeyedMessage {
        let mut msg = KeyedCodec
            .messages(item.payloads[0].data.as_ref().unwrap())
            .into_iter()
            .next()
            .unwrap()
            .unwrap();
        msg.unpack().unwrap();
        msg
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(Ok(Source::Data("year".to_owned())), Source::try_from("data:year".to_owned()));
        assert_eq!(Ok(Source::Const("-10".to_owned())), Source::try_from("const:-10".to_owned()));
        assert_eq!(
            Ok(Source::Array(vec![301150, 307096])),
            Source::try_from("array:301150, 307096".to_owned())
        );
        assert!(Source::try_from("column:year".to_owned()).is_err());
        assert!(Source::try_from("array:1,x".to_owned()).is_err());
    }

    #[test]
    fn test_template() {
        let mapping = Mapping::template("aws-template").unwrap();

        assert_eq!(vec![1, 1], mapping.replication);
        assert_eq!(",", mapping.delimiter);
        assert_eq!(mapping, Mapping::template("aws_mappings.json").unwrap());

        let msl = mapping
            .data
            .iter()
            .find(|e| e.eccodes_key == "#1#pressureReducedToMeanSeaLevel")
            .unwrap();
        assert_eq!(Some(50000.0), msl.valid_min);
        assert_eq!(Some(150000.0), msl.valid_max);
    }

    #[test]
    fn test_unknown_template() {
        let err = Mapping::template("ship-template").unwrap_err();
        assert_eq!("Unknown template: ship-template, options are: aws-template", err.to_string());
    }

    #[test]
    fn test_transform() {
        let mapping = Mapping::template(DEFAULT_TEMPLATE).unwrap();
        let stations = stations();
        let transformer = Csv2BufrTransformer::new(&KeyedCodec, &stations, &mapping);
        let outcomes = transformer.transform(&csv("15015", "47.77706163", "100104")).unwrap();

        assert_eq!(1, outcomes.len());
        let item = emitted(&outcomes[0]);
        assert!(item.diagnostics.is_empty());
        assert_eq!("WIGOS_0-20000-0-15015_20220331T000000", item.meta.identifier);
        assert_eq!(
            Some(PointGeometry::new(23.94046026, 47.77706163, Some(503.0))),
            item.meta.geometry
        );

        let msg = decoded(item);
        assert_eq!(vec![301150, 307096], msg.get_long_array("unexpandedDescriptors").unwrap());
        assert_eq!(vec![1, 1], msg.get_long_array("inputDelayedDescriptorReplicationFactor").unwrap());
        assert_eq!(Some(2022), long_value(&msg, "typicalYear"));
        assert_eq!(Some(-10), long_value(&msg, "#7#timePeriod"));
        assert_eq!(Some(100104.0), double_value(&msg, "#1#pressureReducedToMeanSeaLevel"));
        // No column for it in this file
        assert!(msg.is_missing("#1#windSpeed").unwrap());
    }

    #[test]
    fn test_transform_out_of_range() {
        let mapping = Mapping::template(DEFAULT_TEMPLATE).unwrap();
        let stations = stations();
        let transformer = Csv2BufrTransformer::new(&KeyedCodec, &stations, &mapping);
        let outcomes = transformer.transform(&csv("15015", "47.77706163", "20104")).unwrap();

        let item = emitted(&outcomes[0]);
        assert_eq!(
            vec!["#1#pressureReducedToMeanSeaLevel: Value (20104) out of valid range (50000 - 150000).; Element set to missing".to_owned()],
            item.diagnostics.warnings
        );
        assert!(item.diagnostics.errors.is_empty());
        assert!(decoded(item).is_missing("#1#pressureReducedToMeanSeaLevel").unwrap());
    }

    #[test]
    fn test_transform_unknown_station() {
        let mapping = Mapping::template(DEFAULT_TEMPLATE).unwrap();
        let stations = stations();
        let transformer = Csv2BufrTransformer::new(&KeyedCodec, &stations, &mapping);
        let outcomes = transformer.transform(&csv("15016", "47.77706163", "20104")).unwrap();

        assert_eq!(
            vec![
                Outcome::Rejected(Diagnostics {
                    errors: vec![],
                    warnings: vec![
                        "#1#pressureReducedToMeanSeaLevel: Value (20104) out of valid range (50000 - 150000).; Element set to missing".to_owned(),
                        "Station 0-20000-0-15016 not in station list; skipping".to_owned(),
                    ],
                })
            ],
            outcomes
        );
    }

    #[test]
    fn test_transform_repairs_location() {
        let mapping = Mapping::template(DEFAULT_TEMPLATE).unwrap();
        let stations = stations();
        let transformer = Csv2BufrTransformer::new(&KeyedCodec, &stations, &mapping);
        let outcomes = transformer.transform(&csv("15015", "", "100104")).unwrap();

        let item = emitted(&outcomes[0]);
        assert_eq!(
            vec!["Missing coordinates for station 0-20000-0-15015; using coordinates from station metadata".to_owned()],
            item.diagnostics.warnings
        );
        assert_eq!(Some(PointGeometry::new(23.94, 47.77, Some(503.0))), item.meta.geometry);
        assert_eq!(Some(47.77), double_value(&decoded(item), "#1#latitude"));
    }

    #[test]
    fn test_transform_repaired_location_matches_payload() {
        let mapping = Mapping::template(DEFAULT_TEMPLATE).unwrap();
        let stations = stations();
        let transformer = Csv2BufrTransformer::new(&KeyedCodec, &stations, &mapping);
        let data = csv("15015", "47.77706163", "100104").replace(",503,504.43,", ",,504.43,");
        let outcomes = transformer.transform(&data).unwrap();

        let item = emitted(&outcomes[0]);
        let geometry = item.meta.geometry.unwrap();
        let msg = decoded(item);
        assert_eq!(Some(PointGeometry::new(23.94, 47.77, Some(503.0))), item.meta.geometry);
        assert_eq!(Some(geometry.latitude), double_value(&msg, "#1#latitude"));
        assert_eq!(Some(geometry.longitude), double_value(&msg, "#1#longitude"));
        assert_eq!(geometry.elevation, double_value(&msg, ELEVATION));
    }

    #[test]
    fn test_transform_repaired_location_without_elevation() {
        let mapping = Mapping::template(DEFAULT_TEMPLATE).unwrap();
        let stations = StationDirectory::new(vec![station(
            "0-20000-0-15015",
            Some("15015"),
            PointGeometry::new(23.94, 47.77, None),
            &["csv/test"],
        )]);
        let transformer = Csv2BufrTransformer::new(&KeyedCodec, &stations, &mapping);
        let outcomes = transformer.transform(&csv("15015", "", "100104")).unwrap();

        let item = emitted(&outcomes[0]);
        let msg = decoded(item);
        assert_eq!(Some(PointGeometry::new(23.94, 47.77, None)), item.meta.geometry);
        assert_eq!(Some(23.94), double_value(&msg, "#1#longitude"));
        assert!(msg.is_missing(ELEVATION).unwrap());
    }

    #[test]
    fn test_transform_custom_mapping() {
        let mapping = Mapping::from_json(serde_json::json!({
            "delimiter": ";",
            "header": [
                {"eccodes_key": "unexpandedDescriptors", "value": "array:301150, 307096"}
            ],
            "data": [
                {"eccodes_key": "#1#wigosIdentifierSeries", "value": "data:wsi_series"},
                {"eccodes_key": "#1#wigosIssuerOfIdentifier", "value": "data:wsi_issuer"},
                {"eccodes_key": "#1#wigosIssueNumber", "value": "data:wsi_issue_number"},
                {"eccodes_key": "#1#wigosLocalIdentifierCharacter", "value": "data:wsi_local"},
                {"eccodes_key": "#1#year", "value": "data:year"},
                {"eccodes_key": "#1#month", "value": "data:month"},
                {"eccodes_key": "#1#day", "value": "data:day"},
                {"eccodes_key": "#1#latitude", "value": "data:lat"},
                {"eccodes_key": "#1#longitude", "value": "data:lon"},
                {"eccodes_key": "#1#airTemperature", "value": "data:temp", "offset": 273.15, "valid_max": 333.15}
            ]
        }))
        .unwrap();
        let stations = stations();
        let transformer = Csv2BufrTransformer::new(&KeyedCodec, &stations, &mapping);
        let outcomes = transformer
            .transform("wsi;year;month;day;lat;lon;temp\n0-20000-0-15015;2022;3;31;47.7;23.9;25\n0-20000-0-15015;2022;3;31\n")
            .unwrap();

        assert_eq!(2, outcomes.len());
        let item = emitted(&outcomes[0]);
        assert!(item.diagnostics.is_empty());
        let temperature = double_value(&decoded(item), "#1#airTemperature").unwrap();
        assert!((temperature - 298.15).abs() < 1e-9);
        assert_eq!(
            vec!["Row 3: expected 7 columns, found 4".to_owned()],
            outcomes[1].diagnostics().errors
        );
    }

    #[test]
    fn test_transform_invalid_delimiter() {
        let mut mapping = Mapping::template(DEFAULT_TEMPLATE).unwrap();
        mapping.delimiter = "||".to_owned();
        let stations = stations();
        let transformer = Csv2BufrTransformer::new(&KeyedCodec, &stations, &mapping);

        assert!(matches!(
            transformer.transform("a||b"),
            Err(Csv2BufrError::InvalidDelimiter(_))
        ));
    }
}
