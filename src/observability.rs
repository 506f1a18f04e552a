use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "enrolld_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "enrolld_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: enroll calls that reached the seat decision. Labels: outcome.
pub const ENROLLMENTS_TOTAL: &str = "enrolld_enrollments_total";

/// Counter: successful drops. Labels: outcome (dropped, opted_out).
pub const DROPS_TOTAL: &str = "enrolld_drops_total";

/// Counter: waiters moved into a freed seat.
pub const PROMOTIONS_TOTAL: &str = "enrolld_promotions_total";

/// Counter: audit entries that could not be written.
pub const AUDIT_FAILURES_TOTAL: &str = "enrolld_audit_failures_total";

/// Counter: login attempts. Labels: status.
pub const LOGINS_TOTAL: &str = "enrolld_logins_total";

/// Gauge: live sessions, refreshed by the sweeper. Labels: tenant.
pub const SESSIONS_ACTIVE: &str = "enrolld_sessions_active";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "enrolld_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "enrolld_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "enrolld_connections_rejected_total";

/// Gauge: number of active tenants (loaded ledgers).
pub const TENANTS_ACTIVE: &str = "enrolld_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "enrolld_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "enrolld_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCourse { .. } => "insert_course",
        Command::SelectCourses { .. } => "select_courses",
        Command::InsertStudent { .. } => "register",
        Command::Login { .. } => "login",
        Command::Logout { .. } => "logout",
        Command::SelectProfile { .. } => "profile",
        Command::Enroll { .. } => "enroll",
        Command::Drop { .. } => "drop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_distinct() {
        let cmds = [
            Command::InsertCourse {
                spec: crate::model::CourseSpec::new("C1", "Rust", 1),
            },
            Command::SelectCourses { id: None },
            Command::InsertStudent {
                id: "S1".into(),
                name: "n".into(),
                email: "e".into(),
                password: "p".into(),
            },
            Command::Login {
                email: "e".into(),
                password: "p".into(),
            },
            Command::Logout { token: "t".into() },
            Command::SelectProfile { token: "t".into() },
            Command::Enroll {
                token: "t".into(),
                course_id: "C1".into(),
            },
            Command::Drop {
                token: "t".into(),
                course_id: "C1".into(),
            },
        ];
        let mut labels: Vec<_> = cmds.iter().map(command_label).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), cmds.len());
    }

    #[test]
    fn init_without_port_is_noop() {
        init(None).unwrap();
    }
}
