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

//! Store, publish and summarize the outcomes of one job.

use crate::notify::{Notification, Publisher, StoredItem};
use crate::outcome::{DataFormat, Emitted, ItemMetadata, Outcome, PointGeometry};
use crate::station::TOPIC_PREFIX;
use crate::storage::ObjectStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Overall status of a job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "partial success")]
    PartialSuccess,
    #[serde(rename = "failure")]
    Failure,
}

impl ResultStatus {
    /// Success needs at least one converted item and no diagnostics at all, failure
    /// means nothing was converted.
    pub fn classify(converted: usize, errors: &[String], warnings: &[String]) -> Self {
        if converted == 0 {
            Self::Failure
        } else if errors.is_empty() && warnings.is_empty() {
            Self::Success
        } else {
            Self::PartialSuccess
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataItemMeta {
    pub id: String,
    pub wigos_station_identifier: Option<String>,
    pub data_date: DateTime<Utc>,
    pub geometry: Option<PointGeometry>,
}

impl From<&ItemMetadata> for DataItemMeta {
    fn from(meta: &ItemMetadata) -> Self {
        DataItemMeta {
            id: meta.identifier.clone(),
            wigos_station_identifier: meta.wigos_station_identifier.clone(),
            data_date: meta.data_date,
            geometry: meta.geometry,
        }
    }
}

/// A converted item returned inline, `data` is base64 encoded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataItem {
    pub data: String,
    pub filename: String,
    pub channel: String,
    #[serde(rename = "_meta")]
    pub meta: DataItemMeta,
}

/// Result document of a publishing process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub result: ResultStatus,
    #[serde(rename = "messages transformed")]
    pub messages_transformed: usize,
    #[serde(rename = "messages published")]
    pub messages_published: usize,
    pub data_items: Vec<DataItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl AggregateResult {
    /// Result of a job that could not run at all
    pub fn failure<S: Into<String>>(error: S) -> Self {
        AggregateResult {
            result: ResultStatus::Failure,
            messages_transformed: 0,
            messages_published: 0,
            data_items: Vec::new(),
            files: Vec::new(),
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}

/// Log `error` and turn it into a failed result
pub fn handle_error<S: Into<String>>(error: S) -> AggregateResult {
    let error = error.into();
    tracing::error!(message = "process failed", error = %error);
    AggregateResult::failure(error)
}

/// Channel as used in storage paths and notifications: no surrounding slashes and
/// no WIS2 topic prefix.
pub fn normalize_channel(channel: &str) -> String {
    let channel = channel.trim_matches('/');
    channel
        .strip_prefix(TOPIC_PREFIX)
        .unwrap_or(channel)
        .trim_matches('/')
        .to_owned()
}

/// Storage path of an item: `<YYYY-MM-DD>/wis/<channel>/<identifier>.<ext>`, dated by
/// the observation rather than the time of processing.
pub fn storage_path(channel: &str, meta: &ItemMetadata, format: DataFormat) -> String {
    format!(
        "{}/wis/{}/{}.{}",
        meta.data_date.format("%Y-%m-%d"),
        channel,
        meta.identifier,
        format.extension()
    )
}

#[derive(Default)]
struct Tally {
    published: usize,
    data_items: Vec<DataItem>,
    files: Vec<String>,
    errors: Vec<String>,
}

/// Turns the outcomes of a transform into stored, published and returned data items.
pub struct DataHandler {
    channel: String,
    notify: bool,
    metadata_id: Option<String>,
    store: Option<Arc<dyn ObjectStore>>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl DataHandler {
    pub fn new(channel: &str, notify: bool) -> Self {
        DataHandler {
            channel: normalize_channel(channel),
            notify,
            metadata_id: None,
            store: None,
            publisher: None,
        }
    }

    pub fn with_metadata_id(mut self, metadata_id: Option<String>) -> Self {
        self.metadata_id = metadata_id;
        self
    }

    pub fn with_store(mut self, store: Option<Arc<dyn ObjectStore>>) -> Self {
        self.store = store;
        self
    }

    pub fn with_publisher(mut self, publisher: Option<Arc<dyn Publisher>>) -> Self {
        self.publisher = publisher;
        self
    }

    pub async fn process(&self, outcomes: Vec<Outcome>) -> AggregateResult {
        let mut converted = Vec::new();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for outcome in outcomes {
            match outcome {
                Outcome::Emitted(mut item) => {
                    errors.append(&mut item.diagnostics.errors);
                    warnings.append(&mut item.diagnostics.warnings);
                    converted.push(item);
                }
                Outcome::Rejected(mut diagnostics) => {
                    errors.append(&mut diagnostics.errors);
                    warnings.append(&mut diagnostics.warnings);
                }
            }
        }

        tracing::info!(message = "processing converted items", count = converted.len(), channel = %self.channel);

        let mut tally = Tally::default();
        for item in &converted {
            self.handle_item(item, &mut tally).await;
        }

        errors.append(&mut tally.errors);
        AggregateResult {
            result: ResultStatus::classify(converted.len(), &errors, &warnings),
            messages_transformed: converted.len(),
            messages_published: tally.published,
            data_items: tally.data_items,
            files: tally.files,
            errors,
            warnings,
        }
    }

    async fn handle_item(&self, item: &Emitted, tally: &mut Tally) {
        let meta = &item.meta;
        if let Some(status) = meta.status.as_ref().filter(|s| !s.is_success()) {
            tracing::error!(
                message = "transform reported failure for item",
                identifier = %meta.identifier,
                status = %status.message,
            );
            return;
        }

        for payload in &item.payloads {
            let data = match &payload.data {
                Some(d) => d,
                None => {
                    tally.errors.push(format!(
                        "No data returned WSI={} and timestamp={}",
                        meta.wigos_station_identifier.as_deref().unwrap_or("None"),
                        meta.data_date.to_rfc3339(),
                    ));
                    continue;
                }
            };

            tally.data_items.push(DataItem {
                data: STANDARD.encode(data),
                filename: format!("{}.{}", meta.identifier, payload.format.extension()),
                channel: self.channel.clone(),
                meta: DataItemMeta::from(meta),
            });

            let store = match &self.store {
                Some(s) => s,
                None => {
                    if self.notify {
                        tally
                            .errors
                            .push(format!("Unable to publish {}: no storage configured", meta.identifier));
                    }
                    continue;
                }
            };

            let path = storage_path(&self.channel, meta, payload.format);
            let url = match store.put(&path, data, payload.format.media_type()).await {
                Ok(u) => u,
                Err(e) => {
                    tracing::error!(message = "error storing item", path = %path, error = %e);
                    tally.errors.push(format!("Error storing {}: {}", path, e));
                    continue;
                }
            };

            tally.files.push(url.clone());
            if self.notify {
                self.notify_item(meta, payload.format, &url, data, tally).await;
            }
        }
    }

    async fn notify_item(&self, meta: &ItemMetadata, format: DataFormat, url: &str, data: &[u8], tally: &mut Tally) {
        let publisher = match &self.publisher {
            Some(p) => p,
            None => {
                tally
                    .errors
                    .push(format!("Unable to publish {}: no broker configured", meta.identifier));
                return;
            }
        };

        let item = StoredItem {
            channel: &self.channel,
            meta,
            format,
            url,
            data,
        };
        let notification = Notification::new(&item, self.metadata_id.as_deref(), Utc::now());

        match publisher.publish(&self.channel, &notification).await {
            Ok(()) => tally.published += 1,
            Err(e) => {
                tracing::error!(message = "error publishing notification", identifier = %meta.identifier, error = %e);
                tally.errors.push(format!("Error publishing {}: {}", meta.identifier, e));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::notify::PublishError;
    use crate::outcome::{Diagnostics, Payload, TransformStatus};
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub(crate) paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn put(&self, path: &str, _data: &[u8], _content_type: &str) -> Result<String, StorageError> {
            if path.contains("FAIL") {
                return Err(StorageError::InvalidPath(path.to_owned()));
            }

            self.paths.lock().unwrap().push(path.to_owned());
            Ok(format!("http://localhost/data/{}", path))
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) sent: Mutex<Vec<(String, Notification)>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, channel: &str, notification: &Notification) -> Result<(), PublishError> {
            if self.fail {
                let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
                return Err(PublishError::Serialize(err));
            }

            self.sent
                .lock()
                .unwrap()
                .push((channel.to_owned(), notification.clone()));
            Ok(())
        }
    }

    fn meta(identifier: &str) -> ItemMetadata {
        ItemMetadata {
            identifier: identifier.to_owned(),
            wigos_station_identifier: Some("0-20000-0-64400".to_owned()),
            data_date: Utc.with_ymd_and_hms(2023, 1, 19, 6, 0, 0).unwrap(),
            geometry: Some(PointGeometry::new(11.9, -4.82, Some(16.0))),
            status: None,
        }
    }

    fn emitted(identifier: &str) -> Outcome {
        Outcome::emitted(DataFormat::Bufr4, b"BUFR".to_vec(), meta(identifier))
    }

    #[test]
    fn test_classify() {
        let none: Vec<String> = Vec::new();
        let some = vec!["oops".to_owned()];

        assert_eq!(ResultStatus::Failure, ResultStatus::classify(0, &none, &none));
        assert_eq!(ResultStatus::Failure, ResultStatus::classify(0, &some, &none));
        assert_eq!(ResultStatus::Success, ResultStatus::classify(2, &none, &none));
        assert_eq!(ResultStatus::PartialSuccess, ResultStatus::classify(1, &none, &some));
        assert_eq!(ResultStatus::PartialSuccess, ResultStatus::classify(1, &some, &none));
    }

    #[test]
    fn test_normalize_channel() {
        assert_eq!("synop/test", normalize_channel("/synop/test/"));
        assert_eq!("synop/test", normalize_channel("origin/a/wis2/synop/test"));
    }

    #[test]
    fn test_storage_path() {
        assert_eq!(
            "2023-01-19/wis/synop/test/WIGOS_x.bufr4",
            storage_path("synop/test", &meta("WIGOS_x"), DataFormat::Bufr4)
        );
    }

    #[tokio::test]
    async fn test_inline_only() {
        let handler = DataHandler::new("synop/test", false);
        let result = handler.process(vec![emitted("WIGOS_a")]).await;

        assert_eq!(ResultStatus::Success, result.result);
        assert_eq!(1, result.messages_transformed);
        assert_eq!(0, result.messages_published);
        assert_eq!("QlVGUg==", result.data_items[0].data);
        assert_eq!("WIGOS_a.bufr4", result.data_items[0].filename);
        assert!(result.files.is_empty());
    }

    #[tokio::test]
    async fn test_store_and_publish() {
        let store = Arc::new(RecordingStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = DataHandler::new("/origin/a/wis2/synop/test/", true)
            .with_store(Some(store.clone()))
            .with_publisher(Some(publisher.clone()));

        let result = handler
            .process(vec![
                emitted("WIGOS_a"),
                Outcome::rejected("Station not in station list: wsi=None tsi=99999; skipping"),
            ])
            .await;

        assert_eq!(ResultStatus::PartialSuccess, result.result);
        assert_eq!(1, result.messages_published);
        assert_eq!(
            vec!["2023-01-19/wis/synop/test/WIGOS_a.bufr4".to_owned()],
            *store.paths.lock().unwrap()
        );
        assert_eq!(
            vec!["http://localhost/data/2023-01-19/wis/synop/test/WIGOS_a.bufr4".to_owned()],
            result.files
        );

        let sent = publisher.sent.lock().unwrap();
        assert_eq!("synop/test", sent[0].0);
        assert_eq!("wis2/synop/test/WIGOS_a", sent[0].1.properties.data_id);
    }

    #[tokio::test]
    async fn test_publish_errors_are_per_item() {
        let store = Arc::new(RecordingStore::default());
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let handler = DataHandler::new("synop/test", true)
            .with_store(Some(store.clone()))
            .with_publisher(Some(publisher));

        let result = handler
            .process(vec![emitted("WIGOS_a"), emitted("WIGOS_FAIL"), emitted("WIGOS_b")])
            .await;

        assert_eq!(ResultStatus::PartialSuccess, result.result);
        assert_eq!(3, result.messages_transformed);
        assert_eq!(0, result.messages_published);
        assert_eq!(3, result.data_items.len());
        assert_eq!(2, store.paths.lock().unwrap().len());
        assert_eq!(3, result.errors.len());
        assert!(result.errors[1].starts_with("Error storing"));
    }

    #[tokio::test]
    async fn test_skip_unsuccessful_and_empty_payloads() {
        let mut failed = meta("WIGOS_failed");
        failed.status = Some(TransformStatus {
            code: 0,
            message: "bad row".to_owned(),
        });

        let outcomes = vec![
            Outcome::Emitted(Emitted {
                payloads: vec![Payload {
                    format: DataFormat::Bufr4,
                    data: Some(b"x".to_vec()),
                }],
                meta: failed,
                diagnostics: Diagnostics::default(),
            }),
            Outcome::Emitted(Emitted {
                payloads: vec![Payload {
                    format: DataFormat::Bufr4,
                    data: None,
                }],
                meta: meta("WIGOS_empty"),
                diagnostics: Diagnostics::warning("something odd"),
            }),
        ];

        let result = DataHandler::new("synop/test", false).process(outcomes).await;

        assert_eq!(ResultStatus::PartialSuccess, result.result);
        assert_eq!(2, result.messages_transformed);
        assert!(result.data_items.is_empty());
        assert_eq!(
            vec!["No data returned WSI=0-20000-0-64400 and timestamp=2023-01-19T06:00:00+00:00".to_owned()],
            result.errors
        );
        assert_eq!(vec!["something odd".to_owned()], result.warnings);
    }

    #[tokio::test]
    async fn test_all_rejected_is_failure() {
        let result = DataHandler::new("synop/test", true)
            .process(vec![Outcome::rejected("nope")])
            .await;

        assert_eq!(ResultStatus::Failure, result.result);
        assert_eq!(vec!["nope".to_owned()], result.errors);
    }

    #[test]
    fn test_result_document() {
        let json = serde_json::to_value(handle_error("No stations found")).unwrap();

        assert_eq!(
            serde_json::json!({
                "result": "failure",
                "messages transformed": 0,
                "messages published": 0,
                "data_items": [],
                "errors": ["No stations found"],
                "warnings": []
            }),
            json
        );
    }
}
