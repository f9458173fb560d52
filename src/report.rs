//! Build reports
//!
//! Every reachable stage ends a build with exactly one terminal status,
//! failure or not, so partial progress is always inspectable.

use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

/// Terminal status of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Actions executed and the result was stored
    Succeeded,
    /// A cached entry satisfied the fingerprint; nothing executed
    CacheHit,
    /// Fingerprinting, composition, or execution failed
    Failed,
    /// Not attempted: a dependency failed or the build was cancelled
    Aborted,
}

impl StageStatus {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::CacheHit)
    }

    fn styled(&self) -> String {
        match self {
            Self::Succeeded => style("succeeded").green().to_string(),
            Self::CacheHit => style("cache-hit").cyan().to_string(),
            Self::Failed => style("failed").red().bold().to_string(),
            Self::Aborted => style("aborted").yellow().to_string(),
        }
    }
}

/// One stage's row in the build report
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,

    /// Stage fingerprint, hex; `None` when fingerprinting itself failed
    pub fingerprint: Option<String>,

    /// Wall-clock execution time in milliseconds (zero for hits and aborts)
    pub duration_ms: u64,

    /// Failure detail for `Failed` stages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The result of one build invocation
#[derive(Debug, Serialize)]
pub struct BuildReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Per-stage rows in execution (topological) order
    pub stages: Vec<StageReport>,

    /// Number of stages whose actions actually ran
    pub executed: usize,

    /// Number of stages satisfied from the cache
    pub cache_hits: usize,
}

impl BuildReport {
    /// Whether every stage reached a successful terminal status
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_terminal_success())
    }

    /// First failed stage, for diagnostics
    pub fn first_failure(&self) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|s| matches!(s.status, StageStatus::Failed))
    }

    /// Status of a stage by name
    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| s.status)
    }

    /// Total wall-clock duration
    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Console-styled summary table
    pub fn render(&self) -> String {
        let name_width = self
            .stages
            .iter()
            .map(|s| s.stage.len())
            .max()
            .unwrap_or(5)
            .max(5);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<name_width$}  {:<10}  {:>8}  {}",
            style("STAGE").bold(),
            style("STATUS").bold(),
            style("TIME").bold(),
            style("FINGERPRINT").bold(),
        );
        for stage in &self.stages {
            let time = if stage.duration_ms > 0 {
                format!("{:.1}s", stage.duration_ms as f64 / 1000.0)
            } else {
                "-".to_string()
            };
            let fp = stage
                .fingerprint
                .as_deref()
                .map(|f| &f[..12.min(f.len())])
                .unwrap_or("-");
            let _ = writeln!(
                out,
                "{:<name_width$}  {:<10}  {:>8}  {}",
                stage.stage,
                stage.status.styled(),
                time,
                fp,
            );
            if let Some(error) = &stage.error {
                let _ = writeln!(out, "{:<name_width$}  {}", "", style(error).red());
            }
        }
        let _ = writeln!(
            out,
            "\n{} executed, {} from cache, {:.1}s total",
            self.executed,
            self.cache_hits,
            self.elapsed().as_secs_f64(),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> BuildReport {
        let now = Utc::now();
        BuildReport {
            started_at: now,
            finished_at: now + chrono::Duration::milliseconds(1500),
            stages: vec![
                StageReport {
                    stage: "compile".into(),
                    status: StageStatus::Succeeded,
                    fingerprint: Some("ab".repeat(32)),
                    duration_ms: 1400,
                    error: None,
                },
                StageReport {
                    stage: "package".into(),
                    status: StageStatus::CacheHit,
                    fingerprint: Some("cd".repeat(32)),
                    duration_ms: 0,
                    error: None,
                },
            ],
            executed: 1,
            cache_hits: 1,
        }
    }

    #[test]
    fn success_when_all_terminal_successes() {
        assert!(report().succeeded());
    }

    #[test]
    fn failure_detected() {
        let mut r = report();
        r.stages[0].status = StageStatus::Failed;
        r.stages[0].error = Some("exit 1".into());
        assert!(!r.succeeded());
        assert_eq!(r.first_failure().unwrap().stage, "compile");
    }

    #[test]
    fn render_lists_every_stage() {
        let rendered = report().render();
        assert!(rendered.contains("compile"));
        assert!(rendered.contains("package"));
        assert!(rendered.contains("1 executed"));
    }

    #[test]
    fn json_serializes_statuses_lowercase() {
        let json = serde_json::to_string(&report()).unwrap();
        assert!(json.contains("\"cachehit\""));
        assert!(json.contains("\"succeeded\""));
    }
}
