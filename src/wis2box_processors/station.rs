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

use crate::outcome::PointGeometry;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::io;

/// Topic prefix stripped from station topics and job channels before comparing them
pub const TOPIC_PREFIX: &str = "origin/a/wis2/";

/// Approximate barometer height above station elevation when none is recorded, in metres
const BAROMETER_OFFSET: f64 = 1.25;

#[derive(Debug)]
pub enum ClientError {
    Internal(reqwest::Error),
    InvalidUrl(Url),
    Unexpected(StatusCode, Url),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::InvalidUrl(u) => write!(f, "invalid station index URL {}", u),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Station {
    pub id: String,
    pub geometry: PointGeometry,
    pub properties: StationProperties,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StationProperties {
    #[serde(default)]
    pub name: String,
    pub wigos_station_identifier: String,
    #[serde(default, deserialize_with = "optional_identifier")]
    pub traditional_station_identifier: Option<String>,
    #[serde(default)]
    pub facility_type: String,
    #[serde(default)]
    pub territory_name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub wmo_region: String,
    #[serde(default)]
    pub barometer_height: Option<f64>,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Int(i64),
    Float(f64),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Int(i) => i.to_string(),
            StringOrNumber::Float(f) => f.to_string(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?
        .map(String::from)
        .unwrap_or_default())
}

fn optional_identifier<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?
        .map(String::from)
        .filter(|s| !s.is_empty()))
}

impl Station {
    pub fn wsi(&self) -> &str {
        &self.properties.wigos_station_identifier
    }

    /// True if one of the station topics names `channel`, ignoring the WIS2 topic prefix
    pub fn publishes_to(&self, channel: &str) -> bool {
        let channel = channel.trim_matches('/');
        let channel = channel.strip_prefix(TOPIC_PREFIX).unwrap_or(channel);

        self.properties
            .topics
            .iter()
            .map(|t| t.trim_matches('/'))
            .any(|t| t.strip_prefix(TOPIC_PREFIX).unwrap_or(t) == channel)
    }

    /// Traditional identifier, or the local part of the WIGOS identifier when none is recorded
    fn traditional_or_local(&self) -> Option<String> {
        if let Some(tsi) = &self.properties.traditional_station_identifier {
            return Some(tsi.clone());
        }

        let parts: Vec<&str> = self.wsi().split('-').collect();
        if parts.len() == 4 {
            Some(parts[3].to_owned())
        } else {
            None
        }
    }
}

/// Row of the flat station metadata table produced by `StationDirectory::csv_export`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StationRow {
    pub station_name: String,
    pub wigos_station_identifier: String,
    pub traditional_station_identifier: Option<String>,
    pub facility_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub territory_name: String,
    pub wmo_region: String,
    pub barometer_height: Option<f64>,
}

impl From<&Station> for StationRow {
    fn from(station: &Station) -> Self {
        let elevation = station.geometry.elevation;
        let barometer_height = station
            .properties
            .barometer_height
            .or_else(|| elevation.map(|e| e + BAROMETER_OFFSET));

        StationRow {
            station_name: station.properties.name.clone(),
            wigos_station_identifier: station.wsi().to_owned(),
            traditional_station_identifier: station.traditional_or_local(),
            facility_type: station.properties.facility_type.clone(),
            latitude: station.geometry.latitude,
            longitude: station.geometry.longitude,
            elevation,
            territory_name: station.properties.territory_name.clone(),
            wmo_region: station.properties.wmo_region.clone(),
            barometer_height,
        }
    }
}

/// Somewhere station records can be fetched from in bulk.
#[async_trait]
pub trait StationSource: Send + Sync {
    async fn stations(&self) -> Result<Vec<Station>, ClientError>;
}

/// Fixed set of stations, for deployments without a backend index and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticStations(pub Vec<Station>);

#[async_trait]
impl StationSource for StaticStations {
    async fn stations(&self) -> Result<Vec<Station>, ClientError> {
        Ok(self.0.clone())
    }
}

/// In-memory index of known stations keyed by WIGOS identifier.
///
/// A directory is immutable once built. Processors build a new one for every job
/// instead of sharing one that would need to be invalidated.
#[derive(Debug, Clone, Default)]
pub struct StationDirectory {
    stations: BTreeMap<String, Station>,
}

impl StationDirectory {
    pub fn new<I: IntoIterator<Item = Station>>(stations: I) -> Self {
        StationDirectory {
            stations: stations.into_iter().map(|s| (s.wsi().to_owned(), s)).collect(),
        }
    }

    /// Fetch all stations from `source`, keeping only those publishing to `channel` if
    /// one is given. Failure to fetch is logged and results in an empty directory.
    pub async fn load(source: &dyn StationSource, channel: Option<&str>) -> Self {
        tracing::debug!(message = "loading stations", channel = ?channel);

        match source.stations().await {
            Ok(stations) => {
                let directory = Self::new(
                    stations
                        .into_iter()
                        .filter(|s| channel.map(|c| s.publishes_to(c)).unwrap_or(true)),
                );
                tracing::info!(message = "loaded stations", count = directory.len());
                directory
            }
            Err(e) => {
                tracing::error!(message = "failed to load stations from backend", error = %e);
                Self::default()
            }
        }
    }

    /// Return the WIGOS identifier of the known station matching `wsi`, or failing that,
    /// the first station whose traditional identifier is `tsi`.
    pub fn resolve(&self, wsi: Option<&str>, tsi: Option<&str>) -> Option<&str> {
        if let Some(station) = wsi.and_then(|w| self.station(w)) {
            return Some(station.wsi());
        }

        let tsi = tsi?;
        self.stations
            .values()
            .find(|s| s.properties.traditional_station_identifier.as_deref() == Some(tsi))
            .map(|s| s.wsi())
    }

    pub fn geometry_of(&self, wsi: &str) -> Option<PointGeometry> {
        self.station(wsi).map(|s| s.geometry)
    }

    pub fn station(&self, wsi: &str) -> Option<&Station> {
        self.stations.get(wsi)
    }

    pub fn contains(&self, wsi: &str) -> bool {
        self.station(wsi).is_some()
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn rows(&self, channel: Option<&str>) -> Vec<StationRow> {
        self.stations
            .values()
            .filter(|s| channel.map(|c| s.publishes_to(c)).unwrap_or(true))
            .map(StationRow::from)
            .collect()
    }

    /// Station metadata as CSV text with a header row, `None` if there are no stations.
    pub fn csv_export(&self, channel: Option<&str>) -> Result<Option<String>, csv::Error> {
        let rows = self.rows(channel);
        if rows.is_empty() {
            return Ok(None);
        }

        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row)?;
        }

        let bytes = writer.into_inner().map_err(|e| csv::Error::from(e.into_error()))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| csv::Error::from(io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

#[derive(Deserialize, Debug)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Deserialize, Debug)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Deserialize, Debug)]
struct SearchHit {
    #[serde(rename = "_source")]
    source: Station,
}

/// Client for the `stations` index of the API backend.
#[derive(Debug)]
pub struct StationIndexClient {
    client: Client,
    base_url: Url,
}

impl StationIndexClient {
    const USER_AGENT: &'static str = "wis2box_processors (station directory)";
    const JSON_RESPONSE: &'static str = "application/json";
    const PAGE_SIZE: usize = 50;

    pub fn new(client: Client, base_url: Url) -> Self {
        StationIndexClient { client, base_url }
    }

    async fn page(&self, from: usize) -> Result<Vec<Station>, ClientError> {
        let url = self.search_url()?;
        let query = serde_json::json!({
            "query": {"match_all": {}},
            "size": Self::PAGE_SIZE,
            "from": from,
        });

        tracing::debug!(message = "making station search request", url = %url, from = from);
        let res = self.make_request(url, &query).await?;
        let body = res.json::<SearchResponse>().await.map_err(ClientError::Internal)?;
        Ok(body.hits.hits.into_iter().map(|h| h.source).collect())
    }

    async fn make_request(&self, url: Url, body: &serde_json::Value) -> Result<Response, ClientError> {
        let res = self
            .client
            .post(url.clone())
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .json(body)
            .send()
            .await
            .map_err(ClientError::Internal)?;

        let status = res.status();
        if status == StatusCode::OK {
            Ok(res)
        } else {
            Err(ClientError::Unexpected(status, url))
        }
    }

    fn search_url(&self) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map(|mut p| {
                p.pop_if_empty().push("stations").push("_search");
            })
            .map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?;

        Ok(url)
    }
}

#[async_trait]
impl StationSource for StationIndexClient {
    async fn stations(&self) -> Result<Vec<Station>, ClientError> {
        let mut stations = Vec::new();
        let mut from = 0;

        loop {
            let page = self.page(from).await?;
            if page.is_empty() {
                break;
            }

            from += page.len();
            stations.extend(page);
        }

        Ok(stations)
    }
}
