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

use crate::codec::BufrCodec;
use crate::metrics::ProcessMetrics;
use crate::processor::{ProcessId, Processors};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const TEXT_FORMAT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// State shared by all requests.
pub struct RequestContext<C: BufrCodec> {
    processors: Processors<C>,
    registry: Registry,
    metrics: ProcessMetrics,
}

impl<C: BufrCodec> RequestContext<C> {
    pub fn new(processors: Processors<C>, registry: Registry, metrics: ProcessMetrics) -> Self {
        RequestContext {
            processors,
            registry,
            metrics,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessSummary {
    pub id: String,
    pub title: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessList {
    pub processes: Vec<ProcessSummary>,
}

#[derive(Deserialize, Debug)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub inputs: serde_json::Value,
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    code: &'static str,
    description: String,
}

pub fn router<C: BufrCodec + 'static>(context: Arc<RequestContext<C>>) -> Router {
    Router::new()
        .route("/processes", get(list_processes))
        .route("/processes/:id/execution", post(execute_process::<C>))
        .route("/metrics", get(text_metrics::<C>))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn list_processes() -> Json<ProcessList> {
    Json(ProcessList {
        processes: ProcessId::ALL
            .iter()
            .map(|p| ProcessSummary {
                id: p.as_str().to_owned(),
                title: p.title().to_owned(),
            })
            .collect(),
    })
}

async fn execute_process<C: BufrCodec + 'static>(
    State(context): State<Arc<RequestContext<C>>>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let process = match id.parse::<ProcessId>() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(message = "request for unknown process", id = %id);
            let body = ErrorResponse {
                code: "NoSuchProcess",
                description: e.to_string(),
            };
            return (StatusCode::NOT_FOUND, Json(body)).into_response();
        }
    };

    let output = context.processors.execute(process, request.inputs).await;
    context.metrics.record(process, &output);
    Json(output).into_response()
}

async fn text_metrics<C: BufrCodec + 'static>(State(context): State<Arc<RequestContext<C>>>) -> Response {
    let mut buf = String::new();
    match encode(&mut buf, &context.registry) {
        Ok(_) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            ([(CONTENT_TYPE, TEXT_FORMAT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
