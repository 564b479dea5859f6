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

//! Convert FM-12 SYNOP bulletins to BUFR4.
//!
//! Only section 0 (`AAXX YYGGi`) and section 1 of each report are decoded. Sections
//! 3 and 5 are regional or national and are skipped. Station coordinates and the
//! WIGOS identifier come from the station metadata table, indexed by the `IIiii`
//! block and station number of each report.

use crate::bufr::{set_typical_time, set_wigos_identifier, EncodeError};
use crate::codec::{BufrCodec, MessageHandle, WIGOS_SEQUENCE};
use crate::outcome::{wigos_identifier, DataFormat, Diagnostics, ItemMetadata, Outcome, PointGeometry};
use crate::station::StationRow;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use thiserror::Error;

/// Sequence for synoptic reports from fixed land stations
const SYNOP_SEQUENCE: i64 = 307080;
const TABLE_VERSION: i64 = 30;
const KNOTS_TO_MPS: f64 = 0.51444;
const ZERO_CELSIUS: f64 = 273.15;

#[derive(Debug, Error)]
pub enum SynopError {
    #[error("No SYNOP reports found: missing AAXX section")]
    MissingSection0,

    #[error("Invalid SYNOP date/time group {0:?}")]
    InvalidDateGroup(String),

    #[error("Invalid station metadata: {0}")]
    Metadata(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    Long(i64),
    Double(f64),
}

/// Section 1 of one report decoded to BUFR element values.
#[derive(Debug, Clone, PartialEq)]
pub struct SynopReport {
    /// Block and station number, `IIiii`
    pub station: String,
    pub day: u32,
    pub hour: u32,
    pub elements: Vec<(&'static str, Element)>,
    pub warnings: Vec<String>,
}

impl SynopReport {
    pub fn value(&self, key: &str) -> Option<Element> {
        self.elements.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn long(&mut self, key: &'static str, value: i64) {
        self.elements.push((key, Element::Long(value)));
    }

    fn double(&mut self, key: &'static str, value: f64) {
        self.elements.push((key, Element::Double(value)));
    }

    fn invalid_group(&mut self, group: &str) {
        self.warnings.push(format!(
            "Invalid group {} in report for station {}; group skipped",
            group, self.station
        ));
    }
}

#[derive(Debug, Clone, Copy)]
struct Section0 {
    day: u32,
    hour: u32,
    knots: bool,
}

fn number(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        None
    } else {
        s.parse().ok()
    }
}

fn digit(s: &str, i: usize) -> Option<i64> {
    s.get(i..i + 1).and_then(number)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn is_section_marker(group: &str) -> bool {
    matches!(group, "333" | "444" | "555") || (group.len() == 5 && group.starts_with("222"))
}

fn parse_section0(group: &str) -> Result<Section0, SynopError> {
    let invalid = || SynopError::InvalidDateGroup(group.to_owned());
    if group.len() != 5 {
        return Err(invalid());
    }

    let mut day = group.get(0..2).and_then(number).ok_or_else(invalid)?;
    let hour = group.get(2..4).and_then(number).ok_or_else(invalid)?;
    let mut knots = matches!(digit(group, 4), Some(3) | Some(4));

    // YY + 50 also signals wind speeds in knots
    if day > 50 {
        day -= 50;
        knots = true;
    }

    if !(1..=31).contains(&day) || hour > 23 {
        return Err(invalid());
    }

    Ok(Section0 {
        day: day as u32,
        hour: hour as u32,
        knots,
    })
}

/// Horizontal visibility in metres from code table 4377
fn visibility(vv: i64) -> Option<f64> {
    const SPECIAL: [f64; 10] = [
        0.0, 50.0, 200.0, 500.0, 1000.0, 2000.0, 4000.0, 10000.0, 20000.0, 50000.0,
    ];

    match vv {
        0..=50 => Some(vv as f64 * 100.0),
        56..=80 => Some((vv - 50) as f64 * 1000.0),
        81..=88 => Some(((vv - 80) * 5 + 30) as f64 * 1000.0),
        89 => Some(75000.0),
        90..=99 => Some(SPECIAL[(vv - 90) as usize]),
        _ => None,
    }
}

/// Pressure in Pa from a `PPPP` group in tenths of hPa without the leading thousand
fn pressure(pppp: &str) -> Option<f64> {
    let mut tenths = number(pppp)?;
    if pppp.starts_with('0') {
        tenths += 10000;
    }

    Some(tenths as f64 * 10.0)
}

/// Precipitation amount in kg m-2 from code table 3590
fn precipitation(rrr: i64) -> Option<f64> {
    match rrr {
        0..=989 => Some(rrr as f64),
        990 => Some(0.0),
        991..=999 => Some(round_to((rrr - 990) as f64 / 10.0, 1)),
        _ => None,
    }
}

/// Period of a precipitation amount in hours from code table 4019
fn precipitation_period(tr: i64) -> Option<i64> {
    match tr {
        1 => Some(6),
        2 => Some(12),
        3 => Some(18),
        4 => Some(24),
        5 => Some(1),
        6 => Some(2),
        7 => Some(3),
        8 => Some(9),
        9 => Some(15),
        _ => None,
    }
}

fn temperature(sign: Option<i64>, ttt: Option<i64>) -> Option<f64> {
    let celsius = ttt? as f64 / 10.0;
    match sign? {
        0 => Some(round_to(celsius + ZERO_CELSIUS, 2)),
        1 => Some(round_to(ZERO_CELSIUS - celsius, 2)),
        _ => None,
    }
}

fn parse_report(tokens: &[&str], s0: Section0) -> Result<SynopReport, Diagnostics> {
    let station = tokens.first().copied().unwrap_or_default();
    if station.len() != 5 || number(station).is_none() {
        return Err(Diagnostics::error(format!(
            "Invalid station identifier {}; report skipped",
            station
        )));
    }

    if tokens.get(1) == Some(&"NIL") {
        return Err(Diagnostics::warning(format!("NIL report for station {}; skipping", station)));
    }

    let (irixhvv, nddff) = match (tokens.get(1), tokens.get(2)) {
        (Some(a), Some(b)) if !is_section_marker(a) && !is_section_marker(b) => (*a, *b),
        _ => {
            return Err(Diagnostics::error(format!(
                "Incomplete report for station {}; skipping",
                station
            )))
        }
    };

    let mut report = SynopReport {
        station: station.to_owned(),
        day: s0.day,
        hour: s0.hour,
        elements: Vec::new(),
        warnings: Vec::new(),
    };

    if irixhvv.len() == 5 {
        match digit(irixhvv, 1) {
            Some(1..=3) => report.long("#1#stationType", 1),
            Some(4..=7) => report.long("#1#stationType", 0),
            _ => {}
        }

        if let Some(v) = irixhvv.get(3..5).and_then(number).and_then(visibility) {
            report.double("#1#horizontalVisibility", v);
        }
    } else {
        report.invalid_group(irixhvv);
    }

    let mut rest = &tokens[3..];
    if nddff.len() == 5 {
        let extended = match rest.first() {
            Some(g) if nddff.ends_with("99") && g.len() == 5 && g.starts_with("00") => {
                rest = &rest[1..];
                Some(*g)
            }
            _ => None,
        };
        decode_wind(&mut report, nddff, extended, s0.knots);
    } else {
        report.invalid_group(nddff);
    }

    for group in rest.iter().take_while(|g| !is_section_marker(g)) {
        if group.len() != 5 {
            report.invalid_group(group);
            continue;
        }

        match digit(group, 0) {
            Some(1) => {
                if let Some(t) = temperature(digit(group, 1), group.get(2..5).and_then(number)) {
                    report.double("#1#airTemperature", t);
                }
            }
            Some(2) if group.get(1..2) == Some("9") => {
                if let Some(rh) = group.get(2..5).and_then(number) {
                    report.double("#1#relativeHumidity", rh as f64);
                }
            }
            Some(2) => {
                if let Some(t) = temperature(digit(group, 1), group.get(2..5).and_then(number)) {
                    report.double("#1#dewpointTemperature", t);
                }
            }
            Some(3) => {
                if let Some(p) = group.get(1..5).and_then(pressure) {
                    report.double("#1#nonCoordinatePressure", p);
                }
            }
            Some(4) => {
                // 4a3hhh reports a geopotential height and isn't decoded
                if matches!(group.get(1..2), Some("0") | Some("9")) {
                    if let Some(p) = group.get(1..5).and_then(pressure) {
                        report.double("#1#pressureReducedToMeanSeaLevel", p);
                    }
                }
            }
            Some(5) => {
                let tendency = digit(group, 1);
                if let Some(a) = tendency {
                    report.long("#1#characteristicOfPressureTendency", a);
                }
                if let Some(ppp) = group.get(2..5).and_then(number) {
                    let sign = if matches!(tendency, Some(5..=8)) { -1.0 } else { 1.0 };
                    report.double("#1#3HourPressureChange", sign * ppp as f64 * 10.0);
                }
            }
            Some(6) => {
                let amount = group.get(1..4).and_then(number).and_then(precipitation);
                let period = digit(group, 4).and_then(precipitation_period);
                if let (Some(rr), Some(hours)) = (amount, period) {
                    report.long("#1#timePeriod", -hours);
                    report.double("#1#totalPrecipitationOrTotalWaterEquivalent", rr);
                }
            }
            Some(7) => {
                if let Some(ww) = group.get(1..3).and_then(number) {
                    report.long("#1#presentWeather", ww);
                }
                if let Some(w1) = digit(group, 3) {
                    report.long("#1#pastWeather1", w1);
                }
                if let Some(w2) = digit(group, 4) {
                    report.long("#1#pastWeather2", w2);
                }
            }
            Some(8) => {
                if let Some(nh) = digit(group, 1) {
                    report.long("#1#cloudAmount", nh);
                }
                if let Some(cl) = digit(group, 2) {
                    report.long("#1#cloudType", 30 + cl);
                }
                if let Some(cm) = digit(group, 3) {
                    report.long("#2#cloudType", 20 + cm);
                }
                if let Some(ch) = digit(group, 4) {
                    report.long("#3#cloudType", 10 + ch);
                }
            }
            Some(9) => {}
            _ => report.invalid_group(group),
        }
    }

    Ok(report)
}

fn decode_wind(report: &mut SynopReport, nddff: &str, extended: Option<&str>, knots: bool) {
    match digit(nddff, 0) {
        Some(n @ 0..=8) => report.long("#1#cloudCoverTotal", (n as f64 * 12.5).round() as i64),
        Some(9) => report.long("#1#cloudCoverTotal", 113),
        _ => {}
    }

    match nddff.get(1..3).and_then(number) {
        Some(dd @ 0..=36) => report.long("#1#windDirection", dd * 10),
        Some(99) | None => {}
        Some(_) => report.invalid_group(nddff),
    }

    let speed = match extended {
        Some(g) => g.get(2..5).and_then(number),
        None => nddff.get(3..5).and_then(number),
    };

    if let Some(ff) = speed {
        let factor = if knots { KNOTS_TO_MPS } else { 1.0 };
        report.double("#1#windSpeed", round_to(ff as f64 * factor, 1));
    }
}

/// Split a bulletin into reports. Reports that can't be decoded at all are returned
/// as the diagnostics explaining why.
pub fn parse_bulletin(text: &str) -> Result<Vec<Result<SynopReport, Diagnostics>>, SynopError> {
    let spaced = text.replace('=', " = ");
    let mut tokens = spaced.split_whitespace().skip_while(|t| *t != "AAXX");

    tokens.next().ok_or(SynopError::MissingSection0)?;
    let s0 = parse_section0(tokens.next().unwrap_or_default())?;

    let mut reports = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for token in tokens {
        if token == "=" {
            if !current.is_empty() {
                reports.push(parse_report(&current, s0));
                current.clear();
            }
        } else {
            current.push(token);
        }
    }

    if !current.is_empty() {
        reports.push(parse_report(&current, s0));
    }

    Ok(reports)
}

/// WMO international data sub-category for a report made at `hour`
fn data_sub_category(hour: u32) -> i64 {
    if hour % 6 == 0 {
        2
    } else if hour % 3 == 0 {
        1
    } else {
        0
    }
}

pub struct SynopTransformer<'a, C: BufrCodec> {
    codec: &'a C,
    metadata: Vec<StationRow>,
}

impl<'a, C: BufrCodec> SynopTransformer<'a, C> {
    /// Build a transformer using station metadata in the CSV layout written by
    /// `StationDirectory::csv_export`.
    pub fn new(codec: &'a C, station_csv: &str) -> Result<Self, SynopError> {
        let mut reader = csv::Reader::from_reader(station_csv.as_bytes());
        let metadata = reader.deserialize().collect::<Result<Vec<StationRow>, _>>()?;
        Ok(SynopTransformer { codec, metadata })
    }

    pub fn transform(&self, bulletin: &str, year: i32, month: u32) -> Vec<Outcome> {
        let reports = match parse_bulletin(bulletin) {
            Ok(r) => r,
            Err(e) => return vec![Outcome::rejected(e.to_string())],
        };

        tracing::debug!(message = "decoded SYNOP bulletin", reports = reports.len());
        reports
            .into_iter()
            .map(|r| match r {
                Ok(report) => self.transform_report(report, year, month),
                Err(diagnostics) => Outcome::Rejected(diagnostics),
            })
            .collect()
    }

    fn transform_report(&self, report: SynopReport, year: i32, month: u32) -> Outcome {
        let warnings = report.warnings.clone();
        let row = match self
            .metadata
            .iter()
            .find(|r| r.traditional_station_identifier.as_deref() == Some(report.station.as_str()))
        {
            Some(r) => r,
            None => {
                tracing::warn!(message = "station not in station list", tsi = %report.station);
                return Outcome::Rejected(Diagnostics::warning(format!(
                    "Station {} not in station list; skipping",
                    report.station
                )))
                .with_warnings(warnings);
            }
        };

        let data_date = match NaiveDate::from_ymd_opt(year, month, report.day)
            .and_then(|d| d.and_hms_opt(report.hour, 0, 0))
        {
            Some(d) => DateTime::<Utc>::from_naive_utc_and_offset(d, Utc),
            None => {
                return Outcome::rejected(format!(
                    "Invalid date {}-{:02}-{:02} for station {}; skipping",
                    year, month, report.day, report.station
                ))
                .with_warnings(warnings)
            }
        };

        let wsi = &row.wigos_station_identifier;
        match self.encode(&report, row, &data_date) {
            Ok(bytes) => Outcome::emitted(
                DataFormat::Bufr4,
                bytes,
                ItemMetadata {
                    identifier: wigos_identifier(wsi, &data_date),
                    wigos_station_identifier: Some(wsi.clone()),
                    data_date,
                    geometry: Some(PointGeometry::new(row.longitude, row.latitude, row.elevation)),
                    status: None,
                },
            )
            .with_warnings(warnings),
            Err(e) => {
                tracing::error!(message = "error encoding SYNOP report", station = %report.station, error = %e);
                Outcome::rejected(format!("Error encoding report for station {}: {}", report.station, e))
                    .with_warnings(warnings)
            }
        }
    }

    fn encode(&self, report: &SynopReport, row: &StationRow, date: &DateTime<Utc>) -> Result<Vec<u8>, EncodeError> {
        let mut msg = self.codec.template()?;
        msg.set_long("masterTablesVersionNumber", TABLE_VERSION)?;
        msg.set_long("dataCategory", 0)?;
        msg.set_long("internationalDataSubCategory", data_sub_category(report.hour))?;
        msg.set_long_array("unexpandedDescriptors", &[WIGOS_SEQUENCE, SYNOP_SEQUENCE])?;
        set_typical_time(&mut msg, date)?;
        set_wigos_identifier(&mut msg, &row.wigos_station_identifier)?;

        // Both validated as digits when the report was parsed
        let block = number(&report.station[0..2]).unwrap_or_default();
        let station = number(&report.station[2..5]).unwrap_or_default();
        msg.set_long("#1#blockNumber", block)?;
        msg.set_long("#1#stationNumber", station)?;

        msg.set_long("#1#year", i64::from(date.year()))?;
        msg.set_long("#1#month", i64::from(date.month()))?;
        msg.set_long("#1#day", i64::from(date.day()))?;
        msg.set_long("#1#hour", i64::from(date.hour()))?;
        msg.set_long("#1#minute", 0)?;
        msg.set_double("#1#latitude", row.latitude)?;
        msg.set_double("#1#longitude", row.longitude)?;
        if let Some(e) = row.elevation {
            msg.set_double("#1#heightOfStationGroundAboveMeanSeaLevel", e)?;
        }
        if let Some(b) = row.barometer_height {
            msg.set_double("#1#heightOfBarometerAboveMeanSeaLevel", b)?;
        }

        for (key, value) in &report.elements {
            match value {
                Element::Long(v) => msg.set_long(key, *v)?,
                Element::Double(v) => msg.set_double(key, *v)?,
            }
        }

        Ok(msg.encode()?)
    }
}
