use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mdc_core::{CanonicalRecord, SectorEntry};
use tokio::fs;

use crate::orchestrator::{BatchResult, TargetStatus};

pub const BRIEF_FILE: &str = "brief.md";
pub const BATCH_FILE: &str = "batch.json";

/// Leading sectors of the batch, ordered by board then rank.
pub fn hot_sectors(result: &BatchResult, per_board: usize) -> Vec<&SectorEntry> {
    let mut sectors: Vec<&SectorEntry> = result
        .records
        .iter()
        .filter_map(|record| match record {
            CanonicalRecord::Sector(entry) if entry.rank as usize <= per_board => Some(entry),
            _ => None,
        })
        .collect();
    sectors.sort_by(|a, b| a.board.as_str().cmp(b.board.as_str()).then(a.rank.cmp(&b.rank)));
    sectors
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:+.2}%"))
}

pub fn render_brief(result: &BatchResult) -> String {
    let mut out = format!(
        "# {} collection\n\n- Cycle ID: `{}`\n- Started: {}\n- Finished: {}\n- Status: {}\n- Summary: {}\n",
        result.kind,
        result.cycle_id,
        result.started_at,
        result.finished_at,
        result.status_label(),
        result.summary_line()
    );
    if let Some(err) = &result.dedup_flush_error {
        let _ = writeln!(out, "- Dedup index not saved: {err}");
    }

    out.push_str("\n## Targets\n");
    for outcome in &result.targets {
        let line = match outcome.status {
            TargetStatus::Succeeded => {
                let mut line = format!(
                    "- {}: {} records from {}",
                    outcome.target,
                    outcome.records,
                    outcome.source_id.as_deref().unwrap_or("unknown")
                );
                if !outcome.failovers.is_empty() {
                    let skipped = outcome
                        .failovers
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    let _ = write!(line, " (after {skipped})");
                }
                line
            }
            TargetStatus::Failed | TargetStatus::TimedOut => format!(
                "- {}: FAILED {}",
                outcome.target,
                outcome
                    .failure
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            ),
        };
        out.push_str(&line);
        out.push('\n');
    }

    let hot = hot_sectors(result, 10);
    if !hot.is_empty() {
        out.push_str("\n## Hot Sectors\n| Board | Rank | Sector | Change | Leader |\n|---|---|---|---|---|\n");
        for entry in hot {
            let leader = match &entry.lead_stock_name {
                Some(name) => format!("{name} {}", percent(entry.lead_stock_change_percent)),
                None => "-".to_string(),
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                entry.board.as_str(),
                entry.rank,
                entry.sector_name,
                percent(Some(entry.change_percent)),
                leader
            );
        }
    }
    out
}

/// Write `brief.md` and `batch.json` under `<reports_root>/<cycle_id>/`.
pub async fn write_cycle_report(reports_root: &Path, result: &BatchResult) -> Result<PathBuf> {
    let dir = reports_root.join(result.cycle_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    fs::write(dir.join(BRIEF_FILE), render_brief(result))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    let delta = serde_json::to_vec_pretty(&serde_json::json!({
        "status": result.status_label(),
        "summary": result.summary_line(),
        "result": result,
    }))
    .context("serializing batch result")?;
    fs::write(dir.join(BATCH_FILE), delta)
        .await
        .with_context(|| format!("writing {BATCH_FILE}"))?;

    Ok(dir)
}

/// Markdown index of the most recent `runs` cycle reports, newest first.
pub fn recent_reports_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(BATCH_FILE).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Collection Cycles".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let cycle_id = dir.file_name().to_string_lossy().to_string();
        let batch_path = dir.path().join(BATCH_FILE);
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&batch_path)
                .with_context(|| format!("reading {}", batch_path.display()))?,
        )
        .with_context(|| format!("parsing {}", batch_path.display()))?;

        let field = |pointer: &str| {
            value
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string()
        };
        lines.push(format!("## {} cycle `{cycle_id}`", field("/result/kind")));
        lines.push(format!("- status: {}", field("/status")));
        lines.push(format!("- {}", field("/summary")));
        lines.push(format!("- brief: `{}`", dir.path().join(BRIEF_FILE).display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
