//! Prometheus text exposition
//!
//! Formats a [`MetricsSummary`] for scraping. Served by the HTTP API at
//! `GET /metrics`.

use crate::infra::metrics::{MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(4096);
    write_ingest_metrics(&mut output, site, summary);
    write_status_metrics(&mut output, site, summary);
    write_delivery_metrics(&mut output, site, summary);
    write_gauges(&mut output, site, summary);
    output
}

fn write_ingest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "fleet_location_updates_accepted_total",
        "Location updates applied to bus state",
        MetricType::Counter,
        site,
        summary.updates_accepted,
    );
    write_metric(
        output,
        "fleet_location_updates_stale_total",
        "Location updates discarded as stale or duplicate",
        MetricType::Counter,
        site,
        summary.updates_stale,
    );
    write_metric(
        output,
        "fleet_location_updates_rejected_total",
        "Location updates rejected as malformed, invalid or for unknown buses",
        MetricType::Counter,
        site,
        summary.updates_rejected,
    );
    write_histogram(
        output,
        "fleet_ingest_latency_us",
        "Location ingest latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_ingest_latency_us,
    );
}

fn write_status_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "fleet_status_transitions_total",
        "Status transitions applied",
        MetricType::Counter,
        site,
        summary.transitions_applied,
    );
    write_metric(
        output,
        "fleet_status_transitions_rejected_total",
        "Status transitions rejected by the state machine",
        MetricType::Counter,
        site,
        summary.transitions_rejected,
    );
    write_metric(
        output,
        "fleet_checkins_total",
        "Successful reservation check-ins",
        MetricType::Counter,
        site,
        summary.checkins_succeeded,
    );
    write_metric(
        output,
        "fleet_checkins_failed_total",
        "Rejected reservation check-ins",
        MetricType::Counter,
        site,
        summary.checkins_failed,
    );
}

fn write_delivery_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "fleet_broadcasts_total",
        "Bus deltas queued for fan-out",
        MetricType::Counter,
        site,
        summary.broadcasts_published,
    );
    write_metric(
        output,
        "fleet_broadcasts_queue_full_total",
        "Bus deltas dropped because the fan-out queue was full",
        MetricType::Counter,
        site,
        summary.broadcasts_queue_full,
    );
    write_metric(
        output,
        "fleet_deliveries_total",
        "Messages handed to subscriber channels",
        MetricType::Counter,
        site,
        summary.deliveries_total,
    );
    write_metric(
        output,
        "fleet_deliveries_dropped_total",
        "Messages dropped for slow subscribers",
        MetricType::Counter,
        site,
        summary.deliveries_dropped,
    );
    write_metric(
        output,
        "fleet_notifications_delivered_total",
        "Notifications delivered to at least one channel",
        MetricType::Counter,
        site,
        summary.notifications_delivered,
    );
    write_metric(
        output,
        "fleet_notifications_retained_total",
        "Notifications held for disconnected users",
        MetricType::Counter,
        site,
        summary.notifications_retained,
    );
    write_metric(
        output,
        "fleet_notifications_dropped_total",
        "Notifications dropped",
        MetricType::Counter,
        site,
        summary.notifications_dropped,
    );
}

fn write_gauges(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(output, "fleet_buses", "Registered buses", MetricType::Gauge, site, summary.buses as u64);
    write_metric(
        output,
        "fleet_subscribers",
        "Live push subscriptions",
        MetricType::Gauge,
        site,
        summary.subscribers as u64,
    );
    write_metric(
        output,
        "fleet_subscribers_connected_total",
        "Subscriptions opened",
        MetricType::Counter,
        site,
        summary.subscribers_connected,
    );
    write_metric(
        output,
        "fleet_subscribers_disconnected_total",
        "Subscriptions closed",
        MetricType::Counter,
        site,
        summary.subscribers_disconnected,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::Metrics;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_update_accepted(150);
        metrics.record_update_accepted(250);
        metrics.record_checkin(true);

        let output = format_prometheus_metrics(&metrics.report(4, 2), "addis");

        assert!(output.contains("fleet_location_updates_accepted_total{site=\"addis\"} 2"));
        assert!(output.contains("fleet_ingest_latency_us_bucket{site=\"addis\",le=\"+Inf\"} 2"));
        assert!(output.contains("fleet_ingest_latency_us_count{site=\"addis\"} 2"));
        assert!(output.contains("fleet_checkins_total{site=\"addis\"} 1"));
        assert!(output.contains("fleet_buses{site=\"addis\"} 4"));
        assert!(output.contains("# TYPE fleet_subscribers gauge"));
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let metrics = Metrics::new();
        metrics.record_update_accepted(50);
        metrics.record_update_accepted(300);
        let output = format_prometheus_metrics(&metrics.report(0, 0), "s");
        assert!(output.contains("fleet_ingest_latency_us_bucket{site=\"s\",le=\"100\"} 1"));
        assert!(output.contains("fleet_ingest_latency_us_bucket{site=\"s\",le=\"400\"} 2"));
    }
}
