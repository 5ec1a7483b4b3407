// Copyright 2024 AION Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use prometheus::core::{AtomicF64, GenericCounter, GenericGauge};
use prometheus::{Counter, Encoder, Gauge, TextEncoder};

/// A struct definition for collecting metrics in the relayer.
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Transfers accepted through the ingress API.
    pub transfers_accepted: GenericCounter<AtomicF64>,
    /// Transfers broadcast to the chain.
    pub transfers_submitted: GenericCounter<AtomicF64>,
    /// Transfers confirmed on chain.
    pub transfers_confirmed: GenericCounter<AtomicF64>,
    /// Transfers that reached a failed or permanently failed state.
    pub transfers_failed: GenericCounter<AtomicF64>,
    /// Transfers re-queued by the retry scheduler.
    pub transfers_retried: GenericCounter<AtomicF64>,
    /// Gas spent on submitted transactions.
    pub gas_spent: GenericCounter<AtomicF64>,
    /// Number of execution slots currently in flight.
    pub in_flight_executions: GenericGauge<AtomicF64>,
}

fn counter(name: &str, help: &str) -> crate::Result<Counter> {
    let counter = Counter::new(name, help)?;
    register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(name: &str, help: &str) -> crate::Result<Gauge> {
    let gauge = Gauge::new(name, help)?;
    register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn register(
    collector: Box<dyn prometheus::core::Collector>,
) -> crate::Result<()> {
    match prometheus::default_registry().register(collector) {
        Ok(()) => Ok(()),
        // a second context in the same process keeps the first registration
        Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Metrics {
    /// Instantiates the various metrics and their counters, and registers
    /// the counters with the default registry.
    pub fn new() -> crate::Result<Self> {
        Ok(Self {
            transfers_accepted: counter(
                "transfers_accepted",
                "The total number of transfers accepted through the ingress API",
            )?,
            transfers_submitted: counter(
                "transfers_submitted",
                "The total number of transfers broadcast to the chain",
            )?,
            transfers_confirmed: counter(
                "transfers_confirmed",
                "The total number of transfers confirmed on chain",
            )?,
            transfers_failed: counter(
                "transfers_failed",
                "The total number of transfers that reached a failed state",
            )?,
            transfers_retried: counter(
                "transfers_retried",
                "The total number of transfers re-queued by the retry scheduler",
            )?,
            gas_spent: counter(
                "gas_spent",
                "The total amount of gas spent on submitted transactions",
            )?,
            in_flight_executions: gauge(
                "in_flight_executions",
                "The number of execution slots currently in flight",
            )?,
        })
    }

    /// Gathers the whole default registry into the prometheus text format.
    pub fn gather() -> crate::Result<String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|_| crate::Error::Generic("Invalid UTF-8 in metrics"))
    }
}
