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

use clap::Parser;
use prometheus_client::registry::Registry;
use reqwest::{Client, Url};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;
use wis2box_processors::codec::eccodes::EcCodesCodec;
use wis2box_processors::config::{base_url, BrokerConfig, Config, ConfigError, Credentials, StorageConfig};
use wis2box_processors::http::RequestContext;
use wis2box_processors::metrics::ProcessMetrics;
use wis2box_processors::notify::{MqttBroker, Publisher};
use wis2box_processors::processor::Processors;
use wis2box_processors::station::StationIndexClient;
use wis2box_processors::storage::{BucketStore, ObjectStore};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 4343);
const DEFAULT_TIMEOUT_MILLIS: u64 = 10000;
const DEFAULT_BACKEND_URL: &str = "http://wis2box-api-backend:9200";
const DEFAULT_PUBLIC_BUCKET: &str = "wis2box-public";
const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Parser)]
#[clap(name = "wis2box_processors", version = clap::crate_version!())]
struct Wis2boxProcessorsApplication {
    /// URL of the API backend holding the station index
    #[clap(long, env = "WIS2BOX_API_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    backend_url: Url,

    /// S3 compatible storage endpoint converted data is written to. Converted data is only
    /// returned inline when not set.
    #[clap(long, env = "WIS2BOX_STORAGE_SOURCE")]
    storage_source: Option<Url>,

    /// Bucket for public data
    #[clap(long, env = "WIS2BOX_STORAGE_PUBLIC", default_value_t = DEFAULT_PUBLIC_BUCKET.into())]
    storage_bucket: String,

    #[clap(long, env = "WIS2BOX_STORAGE_USERNAME")]
    storage_username: Option<String>,

    #[clap(long, env = "WIS2BOX_STORAGE_PASSWORD", hide_env_values = true)]
    storage_password: Option<String>,

    /// Public URL of the deployment, stored data is available below `<url>/data/`
    #[clap(long, env = "WIS2BOX_URL", default_value = "http://localhost")]
    wis2box_url: Url,

    /// Host of the MQTT broker. Notifications are not sent when not set.
    #[clap(long, env = "WIS2BOX_BROKER_HOST")]
    broker_host: Option<String>,

    #[clap(long, env = "WIS2BOX_BROKER_PORT", default_value_t = DEFAULT_BROKER_PORT)]
    broker_port: u16,

    #[clap(long, env = "WIS2BOX_BROKER_USERNAME")]
    broker_username: Option<String>,

    #[clap(long, env = "WIS2BOX_BROKER_PASSWORD", hide_env_values = true)]
    broker_password: Option<String>,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Timeout for requests to the API backend and for broker publication, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Address to bind to.
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

impl Wis2boxProcessorsApplication {
    fn config(&self) -> Result<Config, ConfigError> {
        let storage = match &self.storage_source {
            Some(endpoint) => {
                let credentials = Credentials::from_parts(
                    "storage",
                    self.storage_username.clone(),
                    self.storage_password.clone(),
                )?;
                Some(StorageConfig::new(
                    endpoint.clone(),
                    &self.storage_bucket,
                    &self.wis2box_url,
                    credentials,
                )?)
            }
            None => None,
        };

        let broker = match &self.broker_host {
            Some(host) => {
                let credentials =
                    Credentials::from_parts("broker", self.broker_username.clone(), self.broker_password.clone())?;
                Some(BrokerConfig::new(
                    host,
                    self.broker_port,
                    credentials,
                    Duration::from_millis(self.timeout_millis),
                ))
            }
            None => None,
        };

        Ok(Config {
            backend_url: base_url(self.backend_url.clone())?,
            storage,
            broker,
            http_timeout: Duration::from_millis(self.timeout_millis),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = Wis2boxProcessorsApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let config = opts.config().unwrap_or_else(|e| {
        tracing::error!(message = "invalid configuration", error = %e);
        process::exit(1)
    });

    let http_client = Client::builder()
        .timeout(config.http_timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize HTTP client", error = %e);
            process::exit(1)
        });

    let stations = Arc::new(StationIndexClient::new(http_client.clone(), config.backend_url.clone()));
    let store = config.storage.as_ref().map(|c| {
        tracing::info!(message = "storing converted data", endpoint = %c.endpoint, bucket = %c.bucket);
        let store = BucketStore::s3(c).unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize storage", endpoint = %c.endpoint, error = %e);
            process::exit(1)
        });
        Arc::new(store) as Arc<dyn ObjectStore>
    });
    let publisher = config.broker.clone().map(|c| {
        tracing::info!(message = "publishing notifications", host = %c.host, port = c.port);
        Arc::new(MqttBroker::new(c)) as Arc<dyn Publisher>
    });

    let mut registry = Registry::default();
    let metrics = ProcessMetrics::new(&mut registry);
    let processors = Processors::new(EcCodesCodec::new(), stations, store, publisher);
    let context = Arc::new(RequestContext::new(processors, registry, metrics));
    let router = wis2box_processors::http::router(context);

    let server = axum::Server::try_bind(&opts.bind)
        .map(|s| {
            s.serve(router.into_make_service()).with_graceful_shutdown(async {
                // Wait for either SIGTERM or SIGINT to shutdown
                tokio::select! {
                    _ = sigterm() => {}
                    _ = sigint() => {}
                }
            })
        })
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        });

    tracing::info!(message = "server started", address = %opts.bind, backend_url = %config.backend_url);
    server.await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
