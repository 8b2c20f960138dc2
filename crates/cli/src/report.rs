//! Stress report: box-drawn text for terminals, JSON for machines.

use crate::stress::{StressOutcome, StressParams};
use serde::Serialize;
use tether_app::ShutdownReport;

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub roots: usize,
    pub depth: usize,
    pub fanout: usize,
    pub nodes: usize,
    pub build_ms: u64,
    pub readers: usize,
    pub reads: u64,
    pub writes: usize,
    pub exclusion_violations: usize,
    pub read_write_ms: u64,
    pub disposed: usize,
    pub order_violations: usize,
    pub dispose_failures: Vec<String>,
    pub teardown_ms: u64,
    pub shutdown: ShutdownReport,
}

impl StressReport {
    pub fn build(params: &StressParams, outcome: StressOutcome, shutdown: ShutdownReport) -> Self {
        Self {
            roots: params.roots,
            depth: params.depth,
            fanout: params.fanout,
            nodes: outcome.nodes,
            build_ms: outcome.build_time.as_millis() as u64,
            readers: params.readers,
            reads: outcome.reads,
            writes: outcome.writes_completed,
            exclusion_violations: outcome.exclusion_violations,
            read_write_ms: outcome.rw_time.as_millis() as u64,
            disposed: outcome.disposed,
            order_violations: outcome.order_violations,
            dispose_failures: outcome.dispose_failures,
            teardown_ms: outcome.teardown_time.as_millis() as u64,
            shutdown,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.exclusion_violations == 0
            && self.order_violations == 0
            && self.dispose_failures.is_empty()
            && self.disposed == self.nodes
            && self.shutdown.is_clean()
    }

    /// Render as a human-readable terminal report.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("╔══════════════════════════════════════════════════════════════╗\n");
        out.push_str("║                    TETHER STRESS REPORT                      ║\n");
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        out.push_str(&row(
            "Forest:",
            format!("{} x depth {} x fanout {}", self.roots, self.depth, self.fanout),
        ));
        out.push_str(&row("Nodes:", self.nodes));
        out.push_str(&row("Build time:", format!("{} ms", self.build_ms)));
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        out.push_str(&row("Readers:", self.readers));
        out.push_str(&row("Reads:", self.reads));
        out.push_str(&row("Writes:", self.writes));
        out.push_str(&row("Reads cancelled:", self.shutdown.access.reads_cancelled));
        out.push_str(&row("Read/write time:", format!("{} ms", self.read_write_ms)));
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        out.push_str(&row("Disposed:", self.disposed));
        out.push_str(&row("Teardown time:", format!("{} ms", self.teardown_ms)));
        out.push_str(&row("Uptime:", format!("{} ms", self.shutdown.uptime_ms)));
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        if self.is_clean() {
            out.push_str("║  All checks passed.                                          ║\n");
        } else {
            out.push_str("║  PROBLEMS                                                    ║\n");
            out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
            if self.exclusion_violations > 0 {
                out.push_str(&row("Read/write overlaps:", self.exclusion_violations));
            }
            if self.order_violations > 0 {
                out.push_str(&row("Dispose order errors:", self.order_violations));
            }
            if self.disposed != self.nodes {
                out.push_str(&row("Not disposed:", self.nodes.saturating_sub(self.disposed)));
            }
            for failure in self.dispose_failures.iter().chain(&self.shutdown.dispose_failures) {
                out.push_str(&format!("║  Dispose failed: {failure}\n"));
            }
            for root in &self.shutdown.leaked_roots {
                out.push_str(&format!("║  Leaked: {}\n", root.lines().next().unwrap_or(root)));
            }
        }

        out.push_str("╚══════════════════════════════════════════════════════════════╝\n");
        out
    }
}

fn row(label: &str, value: impl std::fmt::Display) -> String {
    format!("║  {:<22}{:>37} ║\n", label, value.to_string())
}
