use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Write};
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use serde::Serialize;

use crate::cache::{HitStats, OpStats};
use crate::error::exit;
use crate::resources::Resources;

/// One executed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: usize,
    pub kind: &'static str,
    pub label: String,
    pub uid: Option<String>,
    /// Seconds since the start of the run.
    pub start: f64,
    pub end: f64,
    pub resources: Resources,
    pub deps: Vec<usize>,
}

impl TaskRecord {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalStep {
    pub name: String,
    pub timing: (f64, f64),
    pub kind: &'static str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub count: usize,
    pub seconds: f64,
}

/// Executed tasks in activation order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeline {
    records: Vec<TaskRecord>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TaskRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    /// Reorders records to follow `activation`, a sequence of task ids.
    /// Ids missing from it go last in their current order.
    pub fn order_by(&mut self, activation: &[usize]) {
        let position: HashMap<usize, usize> = activation
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, pos))
            .collect();
        self.records
            .sort_by_key(|r| position.get(&r.id).copied().unwrap_or(usize::MAX));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of the longest chain ending at the last finished task,
    /// following the latest-finishing dependency at every step. Last
    /// finished first.
    fn critical_records(&self) -> Vec<&TaskRecord> {
        let by_id: HashMap<usize, &TaskRecord> = self.records.iter().map(|r| (r.id, r)).collect();

        let Some(mut current) = self
            .records
            .iter()
            .max_by(|a, b| a.end.total_cmp(&b.end))
        else {
            return Vec::new();
        };

        let mut path = vec![current];
        while let Some(next) = current
            .deps
            .iter()
            .filter_map(|dep| by_id.get(dep).copied())
            .max_by(|a, b| a.end.total_cmp(&b.end))
        {
            path.push(next);
            current = next;
        }
        path
    }

    pub fn critical_path(&self) -> Vec<CriticalStep> {
        self.critical_records()
            .into_iter()
            .rev()
            .map(|r| CriticalStep {
                name: r.label.clone(),
                timing: (r.start, r.end),
                kind: r.kind,
            })
            .collect()
    }

    pub fn kind_stats(&self) -> BTreeMap<&'static str, KindStats> {
        let mut stats: BTreeMap<&'static str, KindStats> = BTreeMap::new();
        for record in &self.records {
            let entry = stats.entry(record.kind).or_default();
            entry.count += 1;
            entry.seconds += record.duration();
        }
        stats
    }

    pub fn render_waterfall_to_file(&self, path: impl AsRef<Utf8Path>) -> io::Result<()> {
        fs::write(path.as_ref(), self.render_waterfall())
    }

    /// SVG chart of the run with one lane per node, ordered by when the
    /// node's first task started. Every task of the node is a bar in its
    /// lane; tasks on the critical path are outlined.
    pub fn render_waterfall(&self) -> String {
        let Some(chart) = Chart::fit(&self.records) else {
            return r#"<svg xmlns="http://www.w3.org/2000/svg" width="240" height="40"><text x="8" y="24">Nothing ran</text></svg>"#.to_string();
        };
        let critical: HashSet<usize> = self.critical_records().iter().map(|r| r.id).collect();

        let mut by_start: Vec<&TaskRecord> = self.records.iter().collect();
        by_start.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut lanes: Vec<Lane<'_>> = Vec::new();
        let mut lane_of: HashMap<&str, usize> = HashMap::new();
        for record in by_start {
            let name = record.uid.as_deref().unwrap_or(&record.label);
            let lane = *lane_of.entry(name).or_insert_with(|| {
                lanes.push(Lane {
                    name,
                    tasks: Vec::new(),
                });
                lanes.len() - 1
            });
            lanes[lane].tasks.push(record);
        }

        let mut svg = String::new();
        // Writing into a String cannot fail.
        let _ = chart.draw(&mut svg, &lanes, &critical);
        svg
    }
}

struct Lane<'t> {
    name: &'t str,
    tasks: Vec<&'t TaskRecord>,
}

const LANE_HEIGHT: u32 = 22;
const LABEL_WIDTH: u32 = 320;
const PLOT_WIDTH: u32 = 900;
const AXIS_HEIGHT: u32 = 28;
const MARGIN: u32 = 8;

/// Maps run time onto the plot area.
struct Chart {
    origin: f64,
    seconds: f64,
}

impl Chart {
    fn fit(records: &[TaskRecord]) -> Option<Self> {
        let origin = records.iter().map(|r| r.start).min_by(f64::total_cmp)?;
        let end = records.iter().map(|r| r.end).max_by(f64::total_cmp)?;
        Some(Self {
            origin,
            seconds: (end - origin).max(1e-6),
        })
    }

    fn x(&self, at: f64) -> f64 {
        f64::from(LABEL_WIDTH + MARGIN) + (at - self.origin) / self.seconds * f64::from(PLOT_WIDTH)
    }

    fn width(&self, seconds: f64) -> f64 {
        (seconds / self.seconds * f64::from(PLOT_WIDTH)).max(1.0)
    }

    /// Gridline spacing of 1, 2 or 5 times a power of ten, about eight
    /// lines across the run.
    fn tick(&self) -> f64 {
        let rough = self.seconds / 8.0;
        let magnitude = 10f64.powf(rough.log10().floor());
        [1.0, 2.0, 5.0]
            .into_iter()
            .map(|m| m * magnitude)
            .find(|&step| step >= rough)
            .unwrap_or(10.0 * magnitude)
    }

    fn draw(&self, svg: &mut String, lanes: &[Lane<'_>], critical: &HashSet<usize>) -> fmt::Result {
        let width = LABEL_WIDTH + PLOT_WIDTH + 3 * MARGIN + 64;
        let height = AXIS_HEIGHT + lanes.len() as u32 * LANE_HEIGHT + MARGIN;
        write!(
            svg,
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" font-family="monospace" font-size="11"><rect width="100%" height="100%" fill="#ffffff"/>"##
        )?;

        let tick = self.tick();
        let mut at = 0.0;
        while at <= self.seconds + tick * 1e-6 {
            let x = self.x(self.origin + at);
            write!(
                svg,
                r##"<line x1="{x:.1}" y1="{AXIS_HEIGHT}" x2="{x:.1}" y2="{height}" stroke="#e5e7eb"/><text x="{x:.1}" y="{}" text-anchor="middle" fill="#6b7280">{}</text>"##,
                AXIS_HEIGHT - 8,
                duration(at),
            )?;
            at += tick;
        }

        for (row, lane) in lanes.iter().enumerate() {
            let y = AXIS_HEIGHT + row as u32 * LANE_HEIGHT;
            if row % 2 == 1 {
                write!(
                    svg,
                    r##"<rect x="0" y="{y}" width="100%" height="{LANE_HEIGHT}" fill="#f8fafc"/>"##
                )?;
            }
            write!(
                svg,
                r##"<text x="{MARGIN}" y="{}" fill="#111827">{}</text>"##,
                y + LANE_HEIGHT / 2 + 4,
                escape(lane.name),
            )?;

            for task in &lane.tasks {
                let outline = match critical.contains(&task.id) {
                    true => r##" stroke="#dc2626" stroke-width="2" class="critical""##,
                    false => "",
                };
                write!(
                    svg,
                    r##"<rect x="{:.1}" y="{}" width="{:.1}" height="{}" rx="2" fill="{}"{outline}><title>{} {}: {}</title></rect>"##,
                    self.x(task.start),
                    y + 4,
                    self.width(task.duration()),
                    LANE_HEIGHT - 8,
                    kind_color(task.kind),
                    task.kind,
                    escape(&task.label),
                    duration(task.duration()),
                )?;
            }
        }

        svg.push_str("</svg>");
        Ok(())
    }
}

fn kind_color(kind: &str) -> &'static str {
    match kind {
        "run" => "#2563eb",
        "restore-local" | "restore-dist" => "#059669",
        "put-local" | "put-dist" => "#d97706",
        "result" => "#7c3aed",
        "resource" | "pattern" => "#0891b2",
        _ => "#9ca3af",
    }
}

fn duration(seconds: f64) -> String {
    match seconds {
        s if s >= 1.0 => format!("{s:.1}s"),
        s => format!("{:.0}ms", s * 1e3),
    }
}

fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['<', '>', '&', '"', '\'']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 16);
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// How a node reached its final state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Built,
    RestoredLocal,
    RestoredDist,
    /// Restored under its content key instead of running.
    DynamicallyRestored,
    Failed,
    /// Never ran because a dependency failed.
    Broken,
    Cancelled,
}

impl NodeStatus {
    /// Satisfied without running a command.
    pub fn is_cached(self) -> bool {
        matches!(
            self,
            NodeStatus::RestoredLocal | NodeStatus::RestoredDist | NodeStatus::DynamicallyRestored
        )
    }
}

/// Telemetry for one uid or one cache operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub status: NodeStatus,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<(f64, f64)>,
    pub resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplicated_by: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dynamically_resolved_cache: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<OpStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits: Option<HitStats>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Everything a run produces.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    /// Materialized outputs per result uid; uids without outputs are absent.
    pub results: BTreeMap<String, Vec<Utf8PathBuf>>,
    pub build_errors: BTreeMap<String, Vec<String>>,
    pub exit_code: i32,
    pub exit_code_map: BTreeMap<String, i32>,
    pub execution_log: BTreeMap<String, LogEntry>,
    pub critical_path: Vec<CriticalStep>,
    pub timeline: Timeline,
    pub cancelled: bool,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.exit_code == exit::SUCCESS
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Short human-facing summary of the run.
    pub fn summary(&self) -> String {
        let mut counts: BTreeMap<NodeStatus, usize> = BTreeMap::new();
        for entry in self.execution_log.values() {
            if entry.kind.is_some() {
                *counts.entry(entry.status).or_default() += 1;
            }
        }
        let count = |status| counts.get(&status).copied().unwrap_or(0);
        let restored = count(NodeStatus::RestoredLocal)
            + count(NodeStatus::RestoredDist)
            + count(NodeStatus::DynamicallyRestored);

        let verdict = if self.cancelled {
            style("Cancelled").yellow().bold()
        } else if self.success() {
            style("Ok").green().bold()
        } else {
            style("Failed").red().bold()
        };

        let mut out = format!(
            "{verdict}: {} built, {} restored, {} failed, {} broken (exit code {})",
            count(NodeStatus::Built),
            restored,
            count(NodeStatus::Failed),
            count(NodeStatus::Broken),
            self.exit_code,
        );
        for (uid, errors) in &self.build_errors {
            for error in errors {
                let _ = write!(out, "\n  {} {uid}: {error}", style("error").red());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: usize, kind: &'static str, start: f64, end: f64, deps: &[usize]) -> TaskRecord {
        TaskRecord {
            id,
            kind,
            label: format!("task-{id}"),
            uid: None,
            start,
            end,
            resources: Resources::ZERO,
            deps: deps.to_vec(),
        }
    }

    #[test]
    fn critical_path_follows_latest_dependency() {
        let mut timeline = Timeline::new();
        timeline.push(record(0, "prepare", 0.0, 0.1, &[]));
        timeline.push(record(1, "run", 0.1, 1.0, &[0]));
        timeline.push(record(2, "run", 0.1, 3.0, &[0]));
        timeline.push(record(3, "run", 3.0, 4.0, &[1, 2]));
        timeline.push(record(4, "run", 0.2, 0.5, &[]));

        let path = timeline.critical_path();
        let names: Vec<_> = path.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["task-0", "task-2", "task-3"]);
        assert_eq!(path[2].timing, (3.0, 4.0));
        assert_eq!(path[2].kind, "run");
    }

    #[test]
    fn order_by_follows_activation() {
        let mut timeline = Timeline::new();
        timeline.push(record(2, "run", 0.5, 1.0, &[]));
        timeline.push(record(7, "result", 1.0, 1.1, &[]));
        timeline.push(record(1, "run", 0.0, 2.0, &[]));

        timeline.order_by(&[1, 2]);
        let ids: Vec<_> = timeline.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 7]);
    }

    #[test]
    fn kind_stats_accumulate() {
        let mut timeline = Timeline::new();
        timeline.push(record(0, "run", 0.0, 1.0, &[]));
        timeline.push(record(1, "run", 0.0, 2.0, &[]));
        timeline.push(record(2, "put-local", 2.0, 2.5, &[1]));
        let stats = timeline.kind_stats();
        assert_eq!(stats["run"].count, 2);
        assert!((stats["run"].seconds - 3.0).abs() < 1e-9);
        assert_eq!(stats["put-local"].count, 1);
    }

    #[test]
    fn waterfall_lanes_per_node_with_critical_path() {
        let mut timeline = Timeline::new();
        assert!(timeline.render_waterfall().contains("Nothing ran"));

        let mut run = record(0, "run", 0.0, 1.0, &[]);
        run.uid = Some("a".into());
        run.label = "CC <a&b>".into();
        let mut put = record(1, "put-local", 1.0, 1.2, &[0]);
        put.uid = Some("a".into());
        let mut other = record(2, "run", 0.1, 0.3, &[]);
        other.uid = Some("b".into());
        timeline.push(run);
        timeline.push(put);
        timeline.push(other);

        let svg = timeline.render_waterfall();
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("CC &lt;a&amp;b&gt;"));
        // Two lanes, one per node.
        assert_eq!(svg.matches(r##"fill="#111827""##).count(), 2);
        // The run and put of `a` are on the critical path, `b` is not.
        assert_eq!(svg.matches(r#"class="critical""#).count(), 2);
    }

    #[test]
    fn waterfall_written_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("run.svg")).unwrap();
        let mut timeline = Timeline::new();
        timeline.push(record(0, "run", 0.0, 2.5, &[]));
        timeline.render_waterfall_to_file(&path).unwrap();
        let svg = fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<title>run task-0: 2.5s</title>"));
    }

    #[test]
    fn summary_counts_statuses() {
        let mut report = RunReport {
            exit_code: exit::FAILURE,
            ..RunReport::default()
        };
        for (uid, status) in [("a", NodeStatus::Built), ("b", NodeStatus::Failed)] {
            report.execution_log.insert(
                uid.into(),
                LogEntry {
                    kind: Some("CC".into()),
                    status,
                    ..LogEntry::default()
                },
            );
        }
        report
            .build_errors
            .insert("b".into(), vec!["exit code 1".into()]);

        console::set_colors_enabled(false);
        let summary = report.summary();
        assert!(summary.starts_with("Failed: 1 built, 0 restored, 1 failed"));
        assert!(summary.contains("b: exit code 1"));
    }
}
