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

use crate::bufr::extract::{identity, location, observation_time};
use crate::codec::{double_value, BufrCodec, CodecError, MessageHandle};
use crate::outcome::PointGeometry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Elements describing the station, time or location of a subset rather than an observation
const DESCRIPTIVE_ELEMENTS: &[&str] = &[
    "wigosIdentifierSeries",
    "wigosIssuerOfIdentifier",
    "wigosIssueNumber",
    "wigosLocalIdentifierCharacter",
    "blockNumber",
    "stationNumber",
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "second",
    "latitude",
    "longitude",
    "heightOfStationGroundAboveMeanSeaLevel",
];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProperties {
    pub name: String,
    pub phenomenon_time: DateTime<Utc>,
    pub report_time: DateTime<Utc>,
    pub report_id: String,
    #[serde(rename = "wigos_station_identifier")]
    pub wigos_station_identifier: String,
    pub value: f64,
}

/// One observed value as a GeoJSON feature.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub geometry: Option<PointGeometry>,
    pub properties: FeatureProperties,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FeatureCollection {
    pub items: Vec<Feature>,
    pub error: String,
}

/// Element name without its `#n#` rank prefix
fn element_name(key: &str) -> &str {
    match key.strip_prefix('#').and_then(|k| k.split_once('#')) {
        Some((_, name)) => name,
        None => key,
    }
}

pub struct GeoJsonTransformer<'a, C: BufrCodec> {
    codec: &'a C,
}

impl<'a, C: BufrCodec> GeoJsonTransformer<'a, C> {
    pub fn new(codec: &'a C) -> Self {
        GeoJsonTransformer { codec }
    }

    /// Every numeric observed element of every subset in `bytes` as a feature.
    pub fn transform(&self, bytes: &[u8]) -> FeatureCollection {
        let mut items = Vec::new();
        let mut error = String::new();

        for (i, res) in self.codec.messages(bytes).into_iter().enumerate() {
            let result = res.and_then(|mut msg| {
                msg.unpack()?;
                self.message_features(&msg, &mut items, &mut error)
            });

            if let Err(e) = result {
                tracing::error!(message = "error converting message", index = i, error = %e);
                error.push_str(&format!("Error processing message {}: {}; ", i + 1, e));
            }
        }

        if items.is_empty() {
            error.push_str("No features generated");
            return FeatureCollection { items, error };
        }

        // All features of a request share the time of the latest observation
        let report_time = items
            .iter()
            .map(|f| f.properties.phenomenon_time)
            .max()
            .unwrap_or_else(Utc::now);
        let datetime_id = report_time.format("%Y%m%d%H%M").to_string();

        for (count, feature) in items.iter_mut().enumerate() {
            let props = &mut feature.properties;
            props.report_time = report_time;
            props.report_id = format!("{}-{}", props.wigos_station_identifier, datetime_id);
            feature.id = format!("{}-{}", props.report_id, count);
        }

        tracing::debug!(message = "generated features", num_features = items.len());
        FeatureCollection { items, error }
    }

    fn message_features(
        &self,
        msg: &C::Message,
        items: &mut Vec<Feature>,
        error: &mut String,
    ) -> Result<(), CodecError> {
        for index in 1..=msg.subset_count()? {
            let subset = msg.extract_subset(index)?;
            let wsi = identity(&subset).wsi.unwrap_or_default();
            let phenomenon_time = match observation_time(&subset) {
                Ok(t) => t,
                Err(e) => {
                    error.push_str(&format!("Error processing subset {} of {}: {}; ", index, wsi, e));
                    continue;
                }
            };

            let geometry = location(&subset);
            for key in subset.data_keys()? {
                let name = element_name(&key);
                if DESCRIPTIVE_ELEMENTS.contains(&name) {
                    continue;
                }

                // Strings and missing values have no feature
                if let Some(value) = double_value(&subset, &key) {
                    items.push(Feature {
                        id: String::new(),
                        type_: "Feature".to_owned(),
                        geometry,
                        properties: FeatureProperties {
                            name: name.to_owned(),
                            phenomenon_time,
                            report_time: phenomenon_time,
                            report_id: String::new(),
                            wigos_station_identifier: wsi.clone(),
                            value,
                        },
                    });
                }
            }
        }

        Ok(())
    }
}
