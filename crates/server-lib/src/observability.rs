//! Observability infrastructure for the netchecker server
//!
//! Provides:
//! - Per-agent Prometheus metrics (report/error counters, HTTP probe gauges)
//! - Structured JSON logging with tracing

use crate::models::{AgentRecord, LivenessVerdict};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prometheus::{
    GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

const NAMESPACE: &str = "ncagent";

/// Metric families registered once per registry
static GLOBAL_FAMILIES: OnceLock<Arc<MetricFamilies>> = OnceLock::new();

struct MetricFamilies {
    report_count: IntCounterVec,
    error_count: IntCounterVec,
    consecutive_errors: IntGaugeVec,
    probe_connection_result: GaugeVec,
    probe_http_code: GaugeVec,
    probe_total: GaugeVec,
    probe_content_transfer: GaugeVec,
    probe_tcp_connection: GaugeVec,
    probe_dns_lookup: GaugeVec,
    probe_connect: GaugeVec,
    probe_server_processing: GaugeVec,
}

fn probe_gauge(name: &str, help: &str) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["agent", "url"])
}

impl MetricFamilies {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let families = Self {
            report_count: IntCounterVec::new(
                Opts::new(
                    "report_count_total",
                    "Total number of reports (keepalive messages) from the agent.",
                )
                .namespace(NAMESPACE),
                &["agent"],
            )?,
            error_count: IntCounterVec::new(
                Opts::new(
                    "error_count_total",
                    "Total number of errors (keepalive miss count) for the agent.",
                )
                .namespace(NAMESPACE),
                &["agent"],
            )?,
            consecutive_errors: IntGaugeVec::new(
                Opts::new(
                    "consecutive_errors",
                    "Keepalive misses since the agent last reported.",
                )
                .namespace(NAMESPACE),
                &["agent"],
            )?,
            probe_connection_result: probe_gauge(
                "http_probe_connection_result",
                "Connection result: 0 - error, 1 - success",
            )?,
            probe_http_code: probe_gauge("http_probe_code", "HTTP status code.")?,
            probe_total: probe_gauge(
                "http_probe_total_time_ms",
                "The total duration of http request.",
            )?,
            probe_content_transfer: probe_gauge(
                "http_probe_content_transfer_time_ms",
                "The duration of content transfer, from the first response byte till the end (in ms).",
            )?,
            probe_tcp_connection: probe_gauge(
                "http_probe_tcp_connection_time_ms",
                "TCP establishing time in ms.",
            )?,
            probe_dns_lookup: probe_gauge(
                "http_probe_dns_lookup_time_ms",
                "DNS lookup time in ms.",
            )?,
            probe_connect: probe_gauge("http_probe_connect_time_ms", "Connection time in ms")?,
            probe_server_processing: probe_gauge(
                "http_probe_server_processing_time_ms",
                "Server processing time in ms.",
            )?,
        };

        registry.register(Box::new(families.report_count.clone()))?;
        registry.register(Box::new(families.error_count.clone()))?;
        registry.register(Box::new(families.consecutive_errors.clone()))?;
        for gauge in families.probe_gauges() {
            registry.register(Box::new(gauge.clone()))?;
        }

        Ok(families)
    }

    fn probe_gauges(&self) -> [&GaugeVec; 8] {
        [
            &self.probe_connection_result,
            &self.probe_http_code,
            &self.probe_total,
            &self.probe_content_transfer,
            &self.probe_tcp_connection,
            &self.probe_dns_lookup,
            &self.probe_connect,
            &self.probe_server_processing,
        ]
    }
}

/// Handles for one agent identity
struct AgentHandles {
    label: String,
    reports: IntCounter,
    errors: IntCounter,
    consecutive: IntGauge,
    errors_since_report: u64,
    urls: HashSet<String>,
}

/// Per-agent metrics recorder
///
/// Clones share the same handles and underlying Prometheus metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    families: Arc<MetricFamilies>,
    agents: Arc<DashMap<String, AgentHandles>>,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a recorder bound to the process-wide default registry
    pub fn new() -> Self {
        let registry = prometheus::default_registry().clone();
        let families = GLOBAL_FAMILIES
            .get_or_init(|| {
                Arc::new(
                    MetricFamilies::register(&registry)
                        .expect("Failed to register netchecker agent metrics"),
                )
            })
            .clone();

        Self {
            registry,
            families,
            agents: Arc::new(DashMap::new()),
        }
    }

    /// Create a recorder bound to a dedicated registry
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let families = Arc::new(MetricFamilies::register(&registry)?);
        Ok(Self {
            registry,
            families,
            agents: Arc::new(DashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Fetch the handles for an identity, creating them on first use.
    ///
    /// Handles already present are returned as-is, so repeated reports from
    /// one agent keep incrementing the same counters.
    fn get_or_create(
        &self,
        identity: &str,
        record: &AgentRecord,
    ) -> dashmap::mapref::one::RefMut<'_, String, AgentHandles> {
        self.agents
            .entry(identity.to_string())
            .or_insert_with(|| {
                let label = record.metric_label();
                debug!(identity = %identity, agent = %label, "Creating agent metric handles");
                AgentHandles {
                    reports: self.families.report_count.with_label_values(&[label.as_str()]),
                    errors: self.families.error_count.with_label_values(&[label.as_str()]),
                    consecutive: self
                        .families
                        .consecutive_errors
                        .with_label_values(&[label.as_str()]),
                    label,
                    errors_since_report: 0,
                    urls: HashSet::new(),
                }
            })
    }

    /// Account for an accepted report
    pub fn record_report(&self, identity: &str, record: &AgentRecord) {
        let mut handles = self.get_or_create(identity, record);
        handles.reports.inc();
        handles.errors_since_report = 0;
        handles.consecutive.set(0);

        let label = handles.label.clone();
        let families = &self.families;
        for probe in &record.probes {
            let values = [label.as_str(), probe.url.as_str()];
            families
                .probe_connection_result
                .with_label_values(&values)
                .set(probe.connection_result as f64);
            families
                .probe_http_code
                .with_label_values(&values)
                .set(probe.http_code as f64);
            families.probe_total.with_label_values(&values).set(probe.total as f64);
            families
                .probe_content_transfer
                .with_label_values(&values)
                .set(probe.content_transfer as f64);
            families
                .probe_tcp_connection
                .with_label_values(&values)
                .set(probe.tcp_connection as f64);
            families
                .probe_dns_lookup
                .with_label_values(&values)
                .set(probe.dns_lookup as f64);
            families
                .probe_connect
                .with_label_values(&values)
                .set(probe.connect as f64);
            families
                .probe_server_processing
                .with_label_values(&values)
                .set(probe.server_processing as f64);
            handles.urls.insert(probe.url.clone());
        }
    }

    /// Count keepalive misses for every stored record.
    ///
    /// A miss is registered at most once per elapsed report interval: the
    /// error counter moves only when the number of missed intervals exceeds
    /// the misses already counted since the last report. Returns the number
    /// of agents whose error counter moved.
    pub fn sweep(&self, records: &HashMap<String, AgentRecord>, now: DateTime<Utc>) -> usize {
        let mut moved = 0;
        for (identity, record) in records {
            if record.report_interval <= 0 {
                continue;
            }
            let elapsed_intervals = (record.age_secs(now) / record.report_interval as f64).floor();
            // The first interval after a report is the one the agent is allowed to use
            let missed = (elapsed_intervals.max(0.0) as u64).saturating_sub(1);

            let mut handles = self.get_or_create(identity, record);
            if missed > handles.errors_since_report {
                handles.errors.inc();
                handles.errors_since_report += 1;
                handles.consecutive.set(handles.errors_since_report as i64);
                moved += 1;
            }
        }
        moved
    }

    /// Drop the handles of an identity.
    ///
    /// Series are labelled per node and network, so several identities may
    /// export the same series. A series is only unregistered once no other
    /// tracked identity still uses it.
    pub fn forget(&self, identity: &str) {
        let Some((_, handles)) = self.agents.remove(identity) else {
            return;
        };
        let label = handles.label.as_str();

        let mut label_in_use = false;
        let mut urls_in_use: HashSet<String> = HashSet::new();
        for other in self.agents.iter().filter(|other| other.label == label) {
            label_in_use = true;
            urls_in_use.extend(other.urls.iter().cloned());
        }

        if label_in_use {
            debug!(
                identity = %identity,
                agent = %label,
                "Keeping series shared with another agent"
            );
        } else {
            let _ = self.families.report_count.remove_label_values(&[label]);
            let _ = self.families.error_count.remove_label_values(&[label]);
            let _ = self.families.consecutive_errors.remove_label_values(&[label]);
        }
        for url in handles.urls.iter().filter(|url| !urls_in_use.contains(*url)) {
            for gauge in self.families.probe_gauges() {
                let _ = gauge.remove_label_values(&[label, url.as_str()]);
            }
        }
    }

    /// Number of agents with live handles
    pub fn tracked_agents(&self) -> usize {
        self.agents.len()
    }

    /// Identities with live handles
    pub fn tracked_identities(&self) -> Vec<String> {
        self.agents.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn report_count(&self, identity: &str) -> Option<u64> {
        self.agents.get(identity).map(|h| h.reports.get())
    }

    pub fn error_count(&self, identity: &str) -> Option<u64> {
        self.agents.get(identity).map(|h| h.errors.get())
    }
}

/// Structured logger for server events
///
/// Provides consistent JSON-formatted logging for reports, purges and
/// connectivity checks.
#[derive(Clone)]
pub struct StructuredLogger {
    backend: String,
}

impl StructuredLogger {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
        }
    }

    /// Log server startup
    pub fn log_startup(&self, version: &str, listen_addr: &str) {
        info!(
            event = "server_started",
            backend = %self.backend,
            version = %version,
            listen_addr = %listen_addr,
            "Netchecker server started"
        );
    }

    /// Log server shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            backend = %self.backend,
            reason = %reason,
            "Netchecker server shutting down"
        );
    }

    pub fn log_report_accepted(&self, identity: &str, record: &AgentRecord) {
        info!(
            event = "report_accepted",
            backend = %self.backend,
            identity = %identity,
            node = %record.node_name,
            report_interval = record.report_interval,
            uptime = record.uptime,
            probes = record.probes.len(),
            "Agent report accepted"
        );
    }

    pub fn log_purge(&self, removed: &[String]) {
        if removed.is_empty() {
            return;
        }
        info!(
            event = "agents_purged",
            backend = %self.backend,
            removed = ?removed,
            "Dropped cached agents no longer expected to report"
        );
    }

    pub fn log_connectivity_check(&self, verdict: &LivenessVerdict) {
        if verdict.is_clean() {
            debug!(
                event = "connectivity_check",
                backend = %self.backend,
                "All agents reported in time"
            );
        } else {
            warn!(
                event = "connectivity_check",
                backend = %self.backend,
                absent = ?verdict.absent,
                outdated = ?verdict.outdated,
                "Absent or outdated agents detected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProbeResult;
    use chrono::Duration;

    fn record(node: &str, pod: &str, interval: i64) -> AgentRecord {
        AgentRecord {
            report_interval: interval,
            node_name: node.to_string(),
            pod_name: pod.to_string(),
            probes: vec![ProbeResult {
                url: "http://kubernetes".to_string(),
                connection_result: 1,
                http_code: 200,
                total: 10,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn isolated() -> AgentMetrics {
        AgentMetrics::with_registry(Registry::new()).unwrap()
    }

    #[test]
    fn test_repeated_reports_share_counter() {
        let metrics = isolated();
        let r = record("node-1", "agent-pod", 5);

        metrics.record_report("agent-pod", &r);
        metrics.record_report("agent-pod", &r);

        assert_eq!(metrics.report_count("agent-pod"), Some(2));
        assert_eq!(metrics.tracked_agents(), 1);
    }

    #[test]
    fn test_global_recorder_can_be_created_twice() {
        let first = AgentMetrics::new();
        let second = AgentMetrics::new();
        let r = record("node-global", "global-pod", 5);

        first.record_report("global-pod", &r);
        second.record_report("global-pod", &r);

        let value = first
            .families
            .report_count
            .with_label_values(&["node-global-private_network"])
            .get();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_probe_gauges_exported() {
        let metrics = isolated();
        metrics.record_report("agent-pod", &record("node-1", "agent-pod", 5));

        let families = metrics.registry().gather();
        let code = families
            .iter()
            .find(|f| f.get_name() == "ncagent_http_probe_code")
            .expect("probe gauge registered");
        assert_eq!(code.get_metric()[0].get_gauge().get_value(), 200.0);
    }

    #[test]
    fn test_sweep_counts_once_per_missed_interval() {
        let metrics = isolated();
        let now = Utc::now();
        let r = record("node-1", "agent-pod", 5);
        metrics.record_report("agent-pod", &r);

        // Within the grace interval nothing is counted
        let mut records = HashMap::new();
        records.insert("agent-pod".to_string(), r.clone().stamp(now - Duration::seconds(7)));
        assert_eq!(metrics.sweep(&records, now), 0);

        // Two intervals elapsed: one miss
        records.insert("agent-pod".to_string(), r.clone().stamp(now - Duration::seconds(11)));
        assert_eq!(metrics.sweep(&records, now), 1);
        // Repeated ticks within the same interval do not count again
        assert_eq!(metrics.sweep(&records, now), 0);
        assert_eq!(metrics.error_count("agent-pod"), Some(1));

        // A fresh report resets the consecutive count
        metrics.record_report("agent-pod", &r);
        records.insert("agent-pod".to_string(), r.stamp(now - Duration::seconds(16)));
        assert_eq!(metrics.sweep(&records, now), 1);
        assert_eq!(metrics.error_count("agent-pod"), Some(2));
    }

    #[test]
    fn test_forget_drops_handles() {
        let metrics = isolated();
        metrics.record_report("agent-pod", &record("node-1", "agent-pod", 5));
        metrics.forget("agent-pod");
        metrics.forget("agent-pod");

        assert_eq!(metrics.tracked_agents(), 0);
        assert_eq!(metrics.report_count("agent-pod"), None);
        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .filter(|f| f.get_name() == "ncagent_report_count_total")
            .all(|f| f.get_metric().is_empty()));
    }

    fn exported_reports(metrics: &AgentMetrics, label: &str) -> Option<f64> {
        metrics
            .registry()
            .gather()
            .iter()
            .filter(|f| f.get_name() == "ncagent_report_count_total")
            .flat_map(|f| f.get_metric().iter())
            .find(|m| m.get_label().iter().any(|l| l.get_value() == label))
            .map(|m| m.get_counter().get_value())
    }

    #[test]
    fn test_forget_keeps_series_shared_with_replacement_pod() {
        let metrics = isolated();
        let old = record("node-1", "agent-old", 5);
        let new = record("node-1", "agent-new", 5);
        metrics.record_report("agent-old", &old);
        metrics.record_report("agent-new", &new);

        metrics.forget("agent-old");
        metrics.record_report("agent-new", &new);
        metrics.record_report("agent-new", &new);

        assert_eq!(metrics.tracked_agents(), 1);
        // The shared counter still reaches the registry and keeps counting
        assert_eq!(exported_reports(&metrics, "node-1-private_network"), Some(4.0));
        let code = metrics
            .registry()
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "ncagent_http_probe_code")
            .expect("probe gauge registered");
        assert_eq!(code.get_metric().len(), 1);

        metrics.forget("agent-new");
        assert_eq!(exported_reports(&metrics, "node-1-private_network"), None);
    }

    #[test]
    fn test_forget_leaves_other_nodes_alone() {
        let metrics = isolated();
        metrics.record_report("agent-a", &record("node-1", "agent-a", 5));
        metrics.record_report("agent-b", &record("node-2", "agent-b", 5));

        metrics.forget("agent-a");
        assert_eq!(exported_reports(&metrics, "node-1-private_network"), None);
        assert_eq!(exported_reports(&metrics, "node-2-private_network"), Some(1.0));
        assert_eq!(metrics.tracked_identities(), vec!["agent-b".to_string()]);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("volatile");
        assert_eq!(logger.backend, "volatile");
    }
}
