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

//! HTTP processing jobs for a WIS2 meteorological data pipeline
//!
//! ## Features
//!
//! `wis2box_processors` accepts raw observations over HTTP, converts them to WMO BUFR4,
//! attaches station metadata, stores the result in object storage and publishes a WIS2
//! notification describing each new artifact. The following processes are available.
//!
//! * `wis2box-bufr2bufr` - Split a BUFR message into one BUFR4 message per subset, resolving
//!   and repairing the station identity and location of every subset.
//! * `wis2box-synop2bufr` - Convert an FM-12 SYNOP bulletin to BUFR4.
//! * `wis2box-csv2bufr` - Convert CSV rows to BUFR4 using a column mapping template.
//! * `bufr2geojson` - Convert a BUFR message to GeoJSON features.
//!
//! Every publishing process returns the same result document:
//!
//! ```text
//! {
//!   "result": "success" | "partial success" | "failure",
//!   "messages transformed": 1,
//!   "messages published": 1,
//!   "data_items": [{"data": "<base64>", "filename": "WIGOS_0-20000-0-64400_20230119T060000.bufr4", ...}],
//!   "errors": [],
//!   "warnings": []
//! }
//! ```
//!
//! ## Stations
//!
//! Observations are only published for stations known to the station index. A fresh
//! [`station::StationDirectory`] is loaded from the backend for every job so that newly
//! registered stations are picked up without any cache invalidation. Observations whose
//! station cannot be resolved are dropped and reported in the `errors` (or `warnings`) list.
//!
//! ## Usage
//!
//! The server binary encodes BUFR with ecCodes and is only built with the `eccodes` feature.
//!
//! ```text
//! cargo build --release --features eccodes
//! ./wis2box_processors --backend-url http://wis2box-api-backend:9200 \
//!     --storage-source http://minio:9000 --wis2box-url http://localhost \
//!     --broker-host mosquitto --broker-port 1883
//! ```
//!
//! Processes are executed synchronously with `POST /processes/{id}/execution` and a body of
//! the form `{"inputs": {...}}`. Prometheus metrics are exposed at `/metrics`.
//!

pub mod bufr;
pub mod codec;
pub mod config;
pub mod csv2bufr;
pub mod geojson;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod notify;
pub mod outcome;
pub mod processor;
pub mod station;
pub mod storage;
pub mod synop;
