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

//! WIS2 notification messages and the broker they are published to.

use crate::config::BrokerConfig;
use crate::outcome::{DataFormat, ItemMetadata, PointGeometry};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const STATION_REPORT_URL: &str = "https://oscar.wmo.int/surface/#/search/station/stationReportDetails/";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("error serializing notification: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("error sending to broker: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("broker connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("no acknowledgement from broker within {0:?}")]
    Timeout(Duration),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Integrity {
    pub method: String,
    pub value: String,
}

impl Integrity {
    /// SHA-512 digest of `data`, base64 encoded
    pub fn sha512(data: &[u8]) -> Self {
        Integrity {
            method: "sha512".to_owned(),
            value: STANDARD.encode(Sha512::digest(data)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Link {
    pub rel: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationProperties {
    pub data_id: String,
    pub datetime: DateTime<Utc>,
    pub pubtime: DateTime<Utc>,
    pub integrity: Integrity,
    pub wigos_station_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_id: Option<String>,
}

/// Announcement of one stored data item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub type_: String,
    pub version: String,
    pub geometry: Option<PointGeometry>,
    pub properties: NotificationProperties,
    pub links: Vec<Link>,
}

/// An item written to storage that a notification can be built for.
#[derive(Debug, Clone, Copy)]
pub struct StoredItem<'a> {
    pub channel: &'a str,
    pub meta: &'a ItemMetadata,
    pub format: DataFormat,
    pub url: &'a str,
    pub data: &'a [u8],
}

impl Notification {
    pub fn new(item: &StoredItem<'_>, metadata_id: Option<&str>, pubtime: DateTime<Utc>) -> Self {
        let wsi = item.meta.wigos_station_identifier.clone();
        let mut links = vec![Link {
            rel: "canonical".to_owned(),
            type_: item.format.media_type().to_owned(),
            href: item.url.to_owned(),
            length: Some(item.data.len()),
        }];

        if let Some(wsi) = &wsi {
            links.push(Link {
                rel: "via".to_owned(),
                type_: "text/html".to_owned(),
                href: format!("{}{}", STATION_REPORT_URL, wsi),
                length: None,
            });
        }

        Notification {
            id: Uuid::new_v4(),
            type_: "Feature".to_owned(),
            version: "v04".to_owned(),
            geometry: item.meta.geometry,
            properties: NotificationProperties {
                data_id: format!("wis2/{}/{}", item.channel, item.meta.identifier),
                datetime: item.meta.data_date,
                pubtime,
                integrity: Integrity::sha512(item.data),
                wigos_station_identifier: wsi,
                metadata_id: metadata_id.map(str::to_owned),
            },
            links,
        }
    }
}

/// Message broker notifications are published to.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `notification` on the topic for `channel`.
    async fn publish(&self, channel: &str, notification: &Notification) -> Result<(), PublishError>;
}

/// Publisher for an MQTT broker. Like a one-shot publish, every notification
/// is sent with QoS 1 over its own connection which is closed once the broker
/// has acknowledged it.
#[derive(Debug, Clone)]
pub struct MqttBroker {
    config: BrokerConfig,
}

impl MqttBroker {
    const CLIENT_ID_PREFIX: &'static str = "wis2box-processors";
    const KEEP_ALIVE: Duration = Duration::from_secs(30);

    pub fn new(config: BrokerConfig) -> Self {
        MqttBroker { config }
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("{}-{}", Self::CLIENT_ID_PREFIX, Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Self::KEEP_ALIVE).set_clean_session(true);
        if let Some(c) = &self.config.credentials {
            options.set_credentials(&c.username, &c.password);
        }

        options
    }
}

/// Drive the connection until the publish is acknowledged and the disconnect sent.
async fn deliver(client: &AsyncClient, eventloop: &mut EventLoop) -> Result<(), PublishError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::PubAck(_)) => client.disconnect().await?,
            Event::Outgoing(Outgoing::Disconnect) => return Ok(()),
            _ => {}
        }
    }
}

#[async_trait]
impl Publisher for MqttBroker {
    async fn publish(&self, channel: &str, notification: &Notification) -> Result<(), PublishError> {
        let topic = self.config.topic(channel);
        let payload = serde_json::to_vec(notification)?;
        tracing::info!(message = "publishing notification", topic = %topic, id = %notification.id);

        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);
        client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        tokio::time::timeout(self.config.timeout, deliver(&client, &mut eventloop))
            .await
            .map_err(|_| PublishError::Timeout(self.config.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use chrono::TimeZone;

    fn meta(wsi: Option<&str>) -> ItemMetadata {
        ItemMetadata {
            identifier: "WIGOS_0-20000-0-64400_20230119T060000".to_owned(),
            wigos_station_identifier: wsi.map(str::to_owned),
            data_date: Utc.with_ymd_and_hms(2023, 1, 19, 6, 0, 0).unwrap(),
            geometry: Some(PointGeometry::new(11.9, -4.82, Some(16.0))),
            status: None,
        }
    }

    #[test]
    fn test_integrity() {
        let integrity = Integrity::sha512(b"");

        assert_eq!("sha512", integrity.method);
        assert_eq!(
            "z4PhNX7vuL3xVChQ1m2AB9Yg5AULVxXcg/SpIdNs6c5H0NE8XYXysP+DGNKHfuwvY7kxvUdBeoGlODJ6+SfaPg==",
            integrity.value
        );
    }

    #[test]
    fn test_notification() {
        let meta = meta(Some("0-20000-0-64400"));
        let data = b"BUFR....7777";
        let item = StoredItem {
            channel: "synop/test",
            meta: &meta,
            format: DataFormat::Bufr4,
            url: "http://localhost/data/2023-01-19/wis/synop/test/WIGOS_0-20000-0-64400_20230119T060000.bufr4",
            data,
        };
        let pubtime = Utc.with_ymd_and_hms(2023, 1, 19, 7, 0, 0).unwrap();
        let notification = Notification::new(&item, Some("urn:wmo:md:test"), pubtime);
        let json = serde_json::to_value(&notification).unwrap();

        assert_eq!("Feature", json["type"]);
        assert_eq!("v04", json["version"]);
        assert_eq!(
            "wis2/synop/test/WIGOS_0-20000-0-64400_20230119T060000",
            json["properties"]["data_id"]
        );
        assert_eq!("2023-01-19T06:00:00Z", json["properties"]["datetime"]);
        assert_eq!("urn:wmo:md:test", json["properties"]["metadata_id"]);
        assert_eq!(serde_json::json!([11.9, -4.82, 16.0]), json["geometry"]["coordinates"]);
        assert_eq!("canonical", json["links"][0]["rel"]);
        assert_eq!("application/bufr", json["links"][0]["type"]);
        assert_eq!(12, json["links"][0]["length"]);
        assert_eq!(
            "https://oscar.wmo.int/surface/#/search/station/stationReportDetails/0-20000-0-64400",
            json["links"][1]["href"]
        );
    }

    #[test]
    fn test_notification_without_station() {
        let meta = meta(None);
        let item = StoredItem {
            channel: "synop/test",
            meta: &meta,
            format: DataFormat::GeoJson,
            url: "http://localhost/data/x.geojson",
            data: b"{}",
        };
        let notification = Notification::new(&item, None, Utc::now());

        assert_eq!(1, notification.links.len());
        assert_eq!(None, notification.properties.metadata_id);
        assert_ne!(notification.id, Notification::new(&item, None, Utc::now()).id);
    }

    fn broker(host: &str, port: u16) -> MqttBroker {
        let credentials = Some(Credentials {
            username: "wis2box".to_owned(),
            password: "secret".to_owned(),
        });
        MqttBroker::new(BrokerConfig::new(host, port, credentials, Duration::from_secs(2)))
    }

    #[test]
    fn test_mqtt_options() {
        let options = broker("mosquitto", 1883).options();

        assert_eq!(("mosquitto".to_owned(), 1883), options.broker_address());
        assert!(options.client_id().starts_with("wis2box-processors-"));
        assert_ne!(options.client_id(), broker("mosquitto", 1883).options().client_id());
    }

    #[tokio::test]
    async fn test_publish_unreachable_broker() {
        let meta = meta(Some("0-20000-0-64400"));
        let item = StoredItem {
            channel: "synop/test",
            meta: &meta,
            format: DataFormat::Bufr4,
            url: "http://localhost/data/x.bufr4",
            data: b"BUFR....7777",
        };
        let notification = Notification::new(&item, None, Utc::now());

        let res = broker("127.0.0.1", 1).publish("synop/test", &notification).await;
        assert!(matches!(
            res,
            Err(PublishError::Connection(_)) | Err(PublishError::Timeout(_))
        ));
    }
}
