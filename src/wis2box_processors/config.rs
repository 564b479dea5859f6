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

//! Service configuration, built once at start up and passed to the clients that need it.

use crate::station::TOPIC_PREFIX;
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} cannot be used as a base URL")]
    NotABase(Url),

    #[error("{0} requires both a username and a password")]
    PartialCredentials(&'static str),
}

/// Username and password of a service, the access and secret key for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Both or neither of `username` and `password` must be given.
    pub fn from_parts(
        service: &'static str,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        match (username, password) {
            (Some(username), Some(password)) => Ok(Some(Credentials { username, password })),
            (None, None) => Ok(None),
            _ => Err(ConfigError::PartialCredentials(service)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// S3 compatible endpoint objects are written to
    pub endpoint: Url,
    /// Bucket for public objects
    pub bucket: String,
    /// Base URL stored objects are retrieved from by data consumers
    pub public_url: Url,
    pub credentials: Option<Credentials>,
}

impl StorageConfig {
    pub fn new(endpoint: Url, bucket: &str, wis2box_url: &Url, credentials: Option<Credentials>) -> Result<Self, ConfigError> {
        Ok(StorageConfig {
            endpoint: base_url(endpoint)?,
            bucket: bucket.trim_matches('/').to_owned(),
            public_url: data_url(wis2box_url)?,
            credentials,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Host name of the MQTT broker
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    /// Prefix of every topic notifications are published to, without a trailing slash
    pub topic_prefix: String,
    /// Longest wait for the broker to acknowledge a notification
    pub timeout: Duration,
}

impl BrokerConfig {
    pub fn new(host: &str, port: u16, credentials: Option<Credentials>, timeout: Duration) -> Self {
        BrokerConfig {
            host: host.to_owned(),
            port,
            credentials,
            topic_prefix: TOPIC_PREFIX.trim_end_matches('/').to_owned(),
            timeout,
        }
    }

    /// Broker topic for notifications about data published on `channel`
    pub fn topic(&self, channel: &str) -> String {
        format!("{}/{}", self.topic_prefix, channel.trim_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// API backend holding the `stations` index
    pub backend_url: Url,
    /// Storage for converted data, items are only returned inline when absent
    pub storage: Option<StorageConfig>,
    /// Broker for notifications, notifications are not sent when absent
    pub broker: Option<BrokerConfig>,
    pub http_timeout: Duration,
}

/// Public data URL of a deployment: `<wis2box_url>/data/`
pub fn data_url(wis2box_url: &Url) -> Result<Url, ConfigError> {
    let mut url = base_url(wis2box_url.clone())?;
    url.path_segments_mut()
        .map(|mut p| {
            p.pop_if_empty().push("data").push("");
        })
        .map_err(|_| ConfigError::NotABase(wis2box_url.clone()))?;

    Ok(url)
}

/// Make sure `url` ends with a slash so that relative paths are joined below it.
pub fn base_url(url: Url) -> Result<Url, ConfigError> {
    if url.cannot_be_a_base() {
        return Err(ConfigError::NotABase(url));
    }

    if url.path().ends_with('/') {
        Ok(url)
    } else {
        let mut with_slash = url.clone();
        with_slash.set_path(&format!("{}/", url.path()));
        Ok(with_slash)
    }
}
