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

//! The processes that can be executed and the inputs each of them accepts.

use crate::bufr::BufrTransformer;
use crate::codec::BufrCodec;
use crate::csv2bufr::{Csv2BufrError, Csv2BufrTransformer, Mapping, DEFAULT_TEMPLATE};
use crate::geojson::{FeatureCollection, GeoJsonTransformer};
use crate::handler::{handle_error, AggregateResult, DataHandler};
use crate::notify::Publisher;
use crate::outcome::Outcome;
use crate::station::{StationDirectory, StationSource};
use crate::storage::ObjectStore;
use crate::synop::{SynopError, SynopTransformer};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessId {
    #[serde(rename = "wis2box-bufr2bufr")]
    Bufr2Bufr,
    #[serde(rename = "wis2box-synop2bufr")]
    Synop2Bufr,
    #[serde(rename = "wis2box-csv2bufr")]
    Csv2Bufr,
    #[serde(rename = "bufr2geojson")]
    Bufr2GeoJson,
}

impl ProcessId {
    pub const ALL: [ProcessId; 4] = [
        ProcessId::Bufr2Bufr,
        ProcessId::Synop2Bufr,
        ProcessId::Csv2Bufr,
        ProcessId::Bufr2GeoJson,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bufr2Bufr => "wis2box-bufr2bufr",
            Self::Synop2Bufr => "wis2box-synop2bufr",
            Self::Csv2Bufr => "wis2box-csv2bufr",
            Self::Bufr2GeoJson => "bufr2geojson",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Bufr2Bufr => "Process and publish BUFR data",
            Self::Synop2Bufr => "Process and publish FM-12 SYNOP bulletins",
            Self::Csv2Bufr => "Process and publish CSV from Automatic Weather Stations",
            Self::Bufr2GeoJson => "Convert BUFR to GeoJSON",
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessId {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| ProcessorError::UnknownProcess(s.to_owned()))
    }
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Unknown process {0}")]
    UnknownProcess(String),

    #[error("Invalid inputs: {0}")]
    InvalidInputs(#[from] serde_json::Error),

    #[error("Invalid base64 data: {0}")]
    InvalidData(#[from] base64::DecodeError),

    #[error("No stations found")]
    NoStations,

    #[error("Error exporting station metadata: {0}")]
    StationExport(#[from] csv::Error),

    #[error("synop2bufr raised Exception: {0}")]
    Synop(#[from] SynopError),

    #[error("csv2bufr raised Exception: {0}")]
    Csv(#[from] Csv2BufrError),
}

fn default_notify() -> bool {
    true
}

#[derive(Deserialize, Debug)]
struct BufrInputs {
    data: String,
    channel: String,
    #[serde(default = "default_notify")]
    notify: bool,
    #[serde(default)]
    metadata_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SynopInputs {
    data: String,
    channel: String,
    #[serde(default = "default_notify")]
    notify: bool,
    #[serde(default)]
    metadata_id: Option<String>,
    year: i32,
    month: u32,
}

#[derive(Deserialize, Debug)]
struct CsvInputs {
    data: String,
    channel: String,
    #[serde(default = "default_notify")]
    notify: bool,
    #[serde(default)]
    metadata_id: Option<String>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    mapping: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct GeoJsonInputs {
    data: String,
}

/// Output document of a process.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ProcessOutput {
    Aggregate(AggregateResult),
    Features(FeatureCollection),
}

impl ProcessOutput {
    pub fn as_aggregate(&self) -> Option<&AggregateResult> {
        match self {
            Self::Aggregate(r) => Some(r),
            Self::Features(_) => None,
        }
    }
}

/// Everything needed to run any of the processes.
pub struct Processors<C: BufrCodec> {
    codec: C,
    stations: Arc<dyn StationSource>,
    store: Option<Arc<dyn ObjectStore>>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl<C: BufrCodec> Processors<C> {
    pub fn new(
        codec: C,
        stations: Arc<dyn StationSource>,
        store: Option<Arc<dyn ObjectStore>>,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Self {
        Processors {
            codec,
            stations,
            store,
            publisher,
        }
    }

    /// Run `process` with JSON `inputs`. Failures are reported in the output
    /// document rather than returned.
    pub async fn execute(&self, process: ProcessId, inputs: serde_json::Value) -> ProcessOutput {
        let span = tracing::span!(Level::INFO, "process", id = %process);
        async {
            tracing::info!(message = "executing process");
            let res = match process {
                ProcessId::Bufr2Bufr => self.bufr2bufr(inputs).await.map(ProcessOutput::Aggregate),
                ProcessId::Synop2Bufr => self.synop2bufr(inputs).await.map(ProcessOutput::Aggregate),
                ProcessId::Csv2Bufr => self.csv2bufr(inputs).await.map(ProcessOutput::Aggregate),
                ProcessId::Bufr2GeoJson => self.bufr2geojson(inputs).map(ProcessOutput::Features),
            };

            match res {
                Ok(output) => output,
                Err(e) => match process {
                    ProcessId::Bufr2GeoJson => ProcessOutput::Features(FeatureCollection {
                        items: Vec::new(),
                        error: e.to_string(),
                    }),
                    _ => ProcessOutput::Aggregate(handle_error(e.to_string())),
                },
            }
        }
        .instrument(span)
        .await
    }

    fn data_handler(&self, channel: &str, notify: bool, metadata_id: Option<String>) -> DataHandler {
        DataHandler::new(channel, notify)
            .with_metadata_id(metadata_id)
            .with_store(self.store.clone())
            .with_publisher(self.publisher.clone())
    }

    async fn bufr2bufr(&self, inputs: serde_json::Value) -> Result<AggregateResult, ProcessorError> {
        let inputs: BufrInputs = serde_json::from_value(inputs)?;
        let bytes = STANDARD.decode(inputs.data.trim())?;
        tracing::debug!(message = "decoded BUFR input", num_bytes = bytes.len());

        let directory = StationDirectory::load(self.stations.as_ref(), None).await;
        let outcomes = BufrTransformer::new(&self.codec, &directory).transform(&bytes);
        Ok(self.publish(&inputs.channel, inputs.notify, inputs.metadata_id, outcomes).await)
    }

    async fn synop2bufr(&self, inputs: serde_json::Value) -> Result<AggregateResult, ProcessorError> {
        let inputs: SynopInputs = serde_json::from_value(inputs)?;
        let directory = StationDirectory::load(self.stations.as_ref(), Some(inputs.channel.as_str())).await;
        let metadata = directory.csv_export(None)?.ok_or(ProcessorError::NoStations)?;

        let outcomes = SynopTransformer::new(&self.codec, &metadata)?.transform(&inputs.data, inputs.year, inputs.month);
        Ok(self.publish(&inputs.channel, inputs.notify, inputs.metadata_id, outcomes).await)
    }

    async fn csv2bufr(&self, inputs: serde_json::Value) -> Result<AggregateResult, ProcessorError> {
        let inputs: CsvInputs = serde_json::from_value(inputs)?;
        let mapping = match inputs.mapping {
            Some(m) => Mapping::from_json(m)?,
            None => Mapping::template(inputs.template.as_deref().unwrap_or(DEFAULT_TEMPLATE))?,
        };

        let directory = StationDirectory::load(self.stations.as_ref(), Some(inputs.channel.as_str())).await;
        let outcomes = Csv2BufrTransformer::new(&self.codec, &directory, &mapping).transform(&inputs.data)?;
        Ok(self.publish(&inputs.channel, inputs.notify, inputs.metadata_id, outcomes).await)
    }

    fn bufr2geojson(&self, inputs: serde_json::Value) -> Result<FeatureCollection, ProcessorError> {
        let inputs: GeoJsonInputs = serde_json::from_value(inputs)?;
        let bytes = STANDARD.decode(inputs.data.trim())?;
        Ok(GeoJsonTransformer::new(&self.codec).transform(&bytes))
    }

    async fn publish(
        &self,
        channel: &str,
        notify: bool,
        metadata_id: Option<String>,
        outcomes: Vec<Outcome>,
    ) -> AggregateResult {
        tracing::debug!(message = "transform finished", outcomes = outcomes.len());
        self.data_handler(channel, notify, metadata_id)
            .process(outcomes)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::keyed::{KeyedCodec, Value};
    use crate::codec::MessageHandle;
    use crate::handler::ResultStatus;
    use crate::outcome::PointGeometry;
    use crate::station::tests::station;
    use crate::station::StaticStations;

    fn processors(stations: Vec<crate::station::Station>) -> Processors<KeyedCodec> {
        Processors::new(KeyedCodec, Arc::new(StaticStations(stations)), None, None)
    }

    fn synop_station() -> crate::station::Station {
        station(
            "0-20000-0-64400",
            Some("64400"),
            PointGeometry::new(11.9, -4.82, Some(16.0)),
            &["origin/a/wis2/synop/test"],
        )
    }

    fn bufr_message() -> String {
        let mut msg = KeyedCodec.template().unwrap();
        let values = [
            ("#1#blockNumber", Value::Long(64)),
            ("#1#stationNumber", Value::Long(400)),
            ("#1#year", Value::Long(2023)),
            ("#1#month", Value::Long(1)),
            ("#1#day", Value::Long(19)),
            ("#1#hour", Value::Long(6)),
            ("#1#latitude", Value::Double(-4.82)),
            ("#1#longitude", Value::Double(11.9)),
            ("#1#airTemperature", Value::Double(283.35)),
        ];
        for (key, value) in values {
            msg.set_subset_value(1, key, value).unwrap();
        }
        STANDARD.encode(msg.encode().unwrap())
    }

    #[test]
    fn test_process_id() {
        assert_eq!(ProcessId::Csv2Bufr, "wis2box-csv2bufr".parse().unwrap());
        assert_eq!("bufr2geojson", ProcessId::Bufr2GeoJson.to_string());
        assert!(matches!(
            "wis2box-cap2geojson".parse::<ProcessId>(),
            Err(ProcessorError::UnknownProcess(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_invalid_inputs() {
        let output = processors(vec![])
            .execute(ProcessId::Bufr2Bufr, serde_json::json!({"channel": "synop/test"}))
            .await;
        let result = output.as_aggregate().unwrap();

        assert_eq!(ResultStatus::Failure, result.result);
        assert_eq!(1, result.errors.len());
        assert!(result.errors[0].starts_with("Invalid inputs: missing field `data`"));
    }

    #[tokio::test]
    async fn test_execute_invalid_base64() {
        let output = processors(vec![])
            .execute(
                ProcessId::Bufr2Bufr,
                serde_json::json!({"data": "!!!", "channel": "synop/test", "notify": false}),
            )
            .await;

        assert!(output.as_aggregate().unwrap().errors[0].starts_with("Invalid base64 data"));
    }

    #[tokio::test]
    async fn test_execute_bufr2bufr() {
        let output = processors(vec![synop_station()])
            .execute(
                ProcessId::Bufr2Bufr,
                serde_json::json!({"data": bufr_message(), "channel": "synop/test", "notify": false}),
            )
            .await;
        let result = output.as_aggregate().unwrap();

        assert_eq!(ResultStatus::Success, result.result);
        assert_eq!(1, result.messages_transformed);
        assert_eq!("WIGOS_0-20000-0-64400_20230119T060000.bufr4", result.data_items[0].filename);
    }

    #[tokio::test]
    async fn test_execute_synop2bufr_no_stations() {
        let output = processors(vec![synop_station()])
            .execute(
                ProcessId::Synop2Bufr,
                serde_json::json!({"data": "AAXX 19064 64400 36/// /0000=", "channel": "synop/other", "year": 2023, "month": 1}),
            )
            .await;

        assert_eq!(
            &AggregateResult::failure("No stations found"),
            output.as_aggregate().unwrap()
        );
    }

    #[tokio::test]
    async fn test_execute_csv2bufr_unknown_template() {
        let output = processors(vec![])
            .execute(
                ProcessId::Csv2Bufr,
                serde_json::json!({"data": "a,b\n1,2", "channel": "csv/test", "template": "ship-template"}),
            )
            .await;

        assert_eq!(
            vec!["csv2bufr raised Exception: Unknown template: ship-template, options are: aws-template".to_owned()],
            output.as_aggregate().unwrap().errors
        );
    }

    #[tokio::test]
    async fn test_execute_bufr2geojson() {
        let output = processors(vec![])
            .execute(ProcessId::Bufr2GeoJson, serde_json::json!({"data": bufr_message()}))
            .await;
        let json = serde_json::to_value(&output).unwrap();

        assert_eq!("", json["error"]);
        assert_eq!(1, json["items"].as_array().unwrap().len());
        assert_eq!("airTemperature", json["items"][0]["properties"]["name"]);
    }
}
