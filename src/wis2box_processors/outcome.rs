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

//! Result of transforming one logical observation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded representations an observation can be published as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    Bufr4,
    GeoJson,
}

impl DataFormat {
    /// File extension, also used as the key naming the format in results.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Bufr4 => "bufr4",
            Self::GeoJson => "geojson",
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Bufr4 => "application/bufr",
            Self::GeoJson => "application/json",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A GeoJSON point with an optional elevation.
///
/// Serialized as `{"type": "Point", "coordinates": [lon, lat]}` or, when an elevation
/// is known, `{"type": "Point", "coordinates": [lon, lat, elevation]}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GeoJsonPoint", into = "GeoJsonPoint")]
pub struct PointGeometry {
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: Option<f64>,
}

impl PointGeometry {
    pub fn new(longitude: f64, latitude: f64, elevation: Option<f64>) -> Self {
        PointGeometry {
            longitude,
            latitude,
            elevation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeoJsonPoint {
    #[serde(rename = "type")]
    type_: String,
    coordinates: Vec<Option<f64>>,
}

impl TryFrom<GeoJsonPoint> for PointGeometry {
    type Error = String;

    fn try_from(value: GeoJsonPoint) -> Result<Self, Self::Error> {
        if value.type_ != "Point" {
            return Err(format!("unsupported geometry type {}", value.type_));
        }

        match value.coordinates.as_slice() {
            [Some(lon), Some(lat)] => Ok(PointGeometry::new(*lon, *lat, None)),
            [Some(lon), Some(lat), elevation] => Ok(PointGeometry::new(*lon, *lat, *elevation)),
            _ => Err(format!("invalid point coordinates {:?}", value.coordinates)),
        }
    }
}

impl From<PointGeometry> for GeoJsonPoint {
    fn from(value: PointGeometry) -> Self {
        let mut coordinates = vec![Some(value.longitude), Some(value.latitude)];
        if let Some(elevation) = value.elevation {
            coordinates.push(Some(elevation));
        }

        GeoJsonPoint {
            type_: "Point".to_owned(),
            coordinates,
        }
    }
}

/// Errors and warnings collected while producing an outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn error<S: Into<String>>(msg: S) -> Self {
        Diagnostics {
            errors: vec![msg.into()],
            warnings: Vec::new(),
        }
    }

    pub fn warning<S: Into<String>>(msg: S) -> Self {
        Diagnostics {
            errors: Vec::new(),
            warnings: vec![msg.into()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Status reported by an upstream transform for a produced item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStatus {
    pub code: i32,
    pub message: String,
}

impl TransformStatus {
    pub const SUCCESS: i32 = 1;

    pub fn is_success(&self) -> bool {
        self.code == Self::SUCCESS
    }
}

/// Metadata describing one converted observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemMetadata {
    /// Canonical identifier, e.g. `WIGOS_0-20000-0-64400_20230119T060000`
    pub identifier: String,
    pub wigos_station_identifier: Option<String>,
    pub data_date: DateTime<Utc>,
    pub geometry: Option<PointGeometry>,
    pub status: Option<TransformStatus>,
}

/// One encoded representation of an observation. `data` is `None` when the upstream
/// transform produced an item without any bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub format: DataFormat,
    pub data: Option<Vec<u8>>,
}

/// An observation that was converted and can be stored and published.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub payloads: Vec<Payload>,
    pub meta: ItemMetadata,
    pub diagnostics: Diagnostics,
}

/// Result of transforming one observation (one BUFR subset, SYNOP report or CSV row).
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Emitted(Emitted),
    Rejected(Diagnostics),
}

impl Outcome {
    /// Single-format outcome for encoded `data` without any diagnostics.
    pub fn emitted(format: DataFormat, data: Vec<u8>, meta: ItemMetadata) -> Self {
        Self::Emitted(Emitted {
            payloads: vec![Payload {
                format,
                data: Some(data),
            }],
            meta,
            diagnostics: Diagnostics::default(),
        })
    }

    pub fn rejected<S: Into<String>>(error: S) -> Self {
        Self::Rejected(Diagnostics::error(error))
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        match self {
            Self::Emitted(e) => &e.diagnostics,
            Self::Rejected(d) => d,
        }
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        match self {
            Self::Emitted(e) => &mut e.diagnostics,
            Self::Rejected(d) => d,
        }
    }

    /// Attach warnings collected before the outcome was decided
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        let diagnostics = self.diagnostics_mut();
        let mut merged = warnings;
        merged.append(&mut diagnostics.warnings);
        diagnostics.warnings = merged;
        self
    }

    pub fn is_emitted(&self) -> bool {
        matches!(self, Self::Emitted(_))
    }
}

/// Identifier used for file names and notifications: `WIGOS_<wsi>_<YYYYmmddTHHMMSS>`
pub fn wigos_identifier(wsi: &str, data_date: &DateTime<Utc>) -> String {
    format!("WIGOS_{}_{}", wsi, data_date.format("%Y%m%dT%H%M%S"))
}
