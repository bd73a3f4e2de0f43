// Copyright (c) 2026 Meshfs
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Process metrics, exposed on `network.metrics_listen_addr` if configured.
//! An ambient concern the distilled spec's Non-goals exclude as a feature
//! surface but not as an observability practice (SPEC_FULL.md §F.1).

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics registration failure.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric name collided, or the registry rejected registration.
    #[error("prometheus registration failed")]
    Registration,
}

/// All process metrics for one node.
#[derive(Clone)]
pub struct Metrics {
    /// Backing registry, scraped by the optional HTTP endpoint.
    pub registry: Registry,

    /// Peers currently `alive`.
    pub peers_alive: IntGauge,
    /// Peers currently `suspect`.
    pub peers_suspect: IntGauge,
    /// Peers evicted since startup.
    pub peers_evicted_total: IntCounter,

    /// Outbound syncs resolved `success`.
    pub sync_success_total: IntCounter,
    /// Outbound syncs resolved `failed`.
    pub sync_failed_total: IntCounter,
    /// Inbound `sync_file` messages rejected for checksum mismatch.
    pub sync_integrity_errors_total: IntCounter,
    /// Conflicts resolved by last-writer-wins.
    pub conflicts_resolved_total: IntCounter,

    /// TCP connections accepted by the router.
    pub connections_total: IntCounter,
    /// Connections closed after their deadline elapsed.
    pub connection_timeouts_total: IntCounter,

    /// Local command invocations, by outcome.
    pub commands_total: IntCounter,
    /// Local command invocations that returned an error response.
    pub commands_failed_total: IntCounter,
}

impl Metrics {
    /// Build and register every metric against a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let peers_alive = gauge("meshfs_peers_alive", "Peers currently alive")?;
        let peers_suspect = gauge("meshfs_peers_suspect", "Peers currently suspect")?;
        let peers_evicted_total = counter("meshfs_peers_evicted_total", "Peers evicted since startup")?;

        let sync_success_total =
            counter("meshfs_sync_success_total", "Outbound syncs resolved success")?;
        let sync_failed_total =
            counter("meshfs_sync_failed_total", "Outbound syncs resolved failed")?;
        let sync_integrity_errors_total = counter(
            "meshfs_sync_integrity_errors_total",
            "Inbound sync_file messages rejected for checksum mismatch",
        )?;
        let conflicts_resolved_total = counter(
            "meshfs_conflicts_resolved_total",
            "Conflicts resolved by last-writer-wins",
        )?;

        let connections_total = counter("meshfs_connections_total", "TCP connections accepted")?;
        let connection_timeouts_total = counter(
            "meshfs_connection_timeouts_total",
            "Connections closed after their deadline elapsed",
        )?;

        let commands_total = counter("meshfs_commands_total", "Local command invocations")?;
        let commands_failed_total = counter(
            "meshfs_commands_failed_total",
            "Local command invocations that returned an error response",
        )?;

        for metric in [
            box_gauge(&peers_alive),
            box_gauge(&peers_suspect),
        ] {
            registry.register(metric).map_err(|_| MetricsError::Registration)?;
        }
        for metric in [
            box_counter(&peers_evicted_total),
            box_counter(&sync_success_total),
            box_counter(&sync_failed_total),
            box_counter(&sync_integrity_errors_total),
            box_counter(&conflicts_resolved_total),
            box_counter(&connections_total),
            box_counter(&connection_timeouts_total),
            box_counter(&commands_total),
            box_counter(&commands_failed_total),
        ] {
            registry.register(metric).map_err(|_| MetricsError::Registration)?;
        }

        Ok(Self {
            registry,
            peers_alive,
            peers_suspect,
            peers_evicted_total,
            sync_success_total,
            sync_failed_total,
            sync_integrity_errors_total,
            conflicts_resolved_total,
            connections_total,
            connection_timeouts_total,
            commands_total,
            commands_failed_total,
        })
    }
}

fn gauge(name: &str, help: &str) -> Result<IntGauge, MetricsError> {
    IntGauge::new(name, help).map_err(|_| MetricsError::Registration)
}

fn counter(name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    IntCounter::new(name, help).map_err(|_| MetricsError::Registration)
}

fn box_gauge(g: &IntGauge) -> Box<dyn prometheus::core::Collector> {
    Box::new(g.clone())
}

fn box_counter(c: &IntCounter) -> Box<dyn prometheus::core::Collector> {
    Box::new(c.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register_without_collision() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.sync_success_total.get(), 0);
    }
}
