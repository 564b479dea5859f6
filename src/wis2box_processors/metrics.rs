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

use crate::processor::{ProcessId, ProcessOutput};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProcessLabels {
    process: String,
}

impl From<ProcessId> for ProcessLabels {
    fn from(process: ProcessId) -> Self {
        ProcessLabels {
            process: process.as_str().to_owned(),
        }
    }
}

/// Counters of the work done by each process.
#[derive(Debug, Clone, Default)]
pub struct ProcessMetrics {
    transformed: Family<ProcessLabels, Counter>,
    published: Family<ProcessLabels, Counter>,
    errors: Family<ProcessLabels, Counter>,
}

impl ProcessMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let metrics = Self::default();

        reg.register(
            "wis2box_messages_transformed",
            "Number of messages converted",
            metrics.transformed.clone(),
        );
        reg.register(
            "wis2box_messages_published",
            "Number of notifications published",
            metrics.published.clone(),
        );
        reg.register(
            "wis2box_errors",
            "Number of errors reported by processes",
            metrics.errors.clone(),
        );

        metrics
    }

    pub fn record(&self, process: ProcessId, output: &ProcessOutput) {
        let labels = ProcessLabels::from(process);
        match output {
            ProcessOutput::Aggregate(result) => {
                self.transformed
                    .get_or_create(&labels)
                    .inc_by(result.messages_transformed as u64);
                self.published
                    .get_or_create(&labels)
                    .inc_by(result.messages_published as u64);
                self.errors.get_or_create(&labels).inc_by(result.errors.len() as u64);
            }
            ProcessOutput::Features(collection) => {
                self.transformed
                    .get_or_create(&labels)
                    .inc_by(collection.items.len() as u64);
                if !collection.error.is_empty() {
                    self.errors.get_or_create(&labels).inc();
                }
            }
        }
    }
}
