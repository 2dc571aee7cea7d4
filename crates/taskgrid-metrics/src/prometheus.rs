//! Prometheus text exposition format.
//!
//! Renders worker performance records and cluster aggregates into the
//! Prometheus text exposition format for scraping.

use taskgrid_core::{ClusterMetrics, HealthStatus, PerformanceRecord};

/// Render worker and cluster snapshots into Prometheus text format.
///
/// Worker series carry a `worker` label, cluster series a `cluster` label.
pub fn render_prometheus(workers: &[PerformanceRecord], clusters: &[ClusterMetrics]) -> String {
    let mut out = String::new();

    worker_gauge(&mut out, "taskgrid_worker_success_rate", "Rolling success rate (0.0-1.0).", workers, |r| {
        format!("{:.4}", r.success_rate)
    });
    worker_gauge(&mut out, "taskgrid_worker_latency_ms", "Rolling average latency in milliseconds.", workers, |r| {
        format!("{:.2}", r.avg_latency_ms)
    });
    worker_gauge(&mut out, "taskgrid_worker_cost", "Rolling average cost per task.", workers, |r| {
        format!("{:.6}", r.avg_cost)
    });

    out.push_str("# HELP taskgrid_worker_requests_total Executions tracked for the worker.\n");
    out.push_str("# TYPE taskgrid_worker_requests_total counter\n");
    for r in workers {
        out.push_str(&format!(
            "taskgrid_worker_requests_total{{worker=\"{}\"}} {}\n",
            r.worker_id, r.total_requests
        ));
    }

    out.push_str("# HELP taskgrid_worker_errors_total Failed executions for the worker.\n");
    out.push_str("# TYPE taskgrid_worker_errors_total counter\n");
    for r in workers {
        out.push_str(&format!(
            "taskgrid_worker_errors_total{{worker=\"{}\"}} {}\n",
            r.worker_id, r.error_count
        ));
    }

    worker_gauge(&mut out, "taskgrid_worker_circuit_open", "1 while the worker's circuit is open.", workers, |r| {
        u8::from(r.circuit_open).to_string()
    });
    worker_gauge(&mut out, "taskgrid_worker_health", "0 healthy, 1 degraded, 2 failing, 3 circuit open.", workers, |r| {
        health_code(r.health).to_string()
    });

    cluster_gauge(&mut out, "taskgrid_cluster_workers", "Workers in the cluster.", clusters, |c| {
        c.worker_count.to_string()
    });
    cluster_gauge(&mut out, "taskgrid_cluster_idle_workers", "Idle workers in the cluster.", clusters, |c| {
        c.idle_workers.to_string()
    });
    cluster_gauge(&mut out, "taskgrid_cluster_utilization", "In-flight load over capacity (0.0-1.0).", clusters, |c| {
        format!("{:.4}", c.utilization)
    });
    cluster_gauge(&mut out, "taskgrid_cluster_error_rate", "Errors over requests (0.0-1.0).", clusters, |c| {
        format!("{:.4}", c.error_rate)
    });

    out
}

fn worker_gauge(
    out: &mut String,
    name: &str,
    help: &str,
    workers: &[PerformanceRecord],
    value: impl Fn(&PerformanceRecord) -> String,
) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    for r in workers {
        out.push_str(&format!("{name}{{worker=\"{}\"}} {}\n", r.worker_id, value(r)));
    }
}

fn cluster_gauge(
    out: &mut String,
    name: &str,
    help: &str,
    clusters: &[ClusterMetrics],
    value: impl Fn(&ClusterMetrics) -> String,
) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    for c in clusters {
        out.push_str(&format!("{name}{{cluster=\"{}\"}} {}\n", c.cluster_id, value(c)));
    }
}

fn health_code(health: HealthStatus) -> u8 {
    match health {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Failing => 2,
        HealthStatus::CircuitOpen => 3,
    }
}
