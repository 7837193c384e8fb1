//! Human readable rendering of command results

use comfy_table::{presets::UTF8_BORDERS_ONLY, Table};
use strata_core::{
	infra::{daemon::DaemonStatus, queue::QueueStats},
	ops::{
		indexing::{DiscoveryReport, PoolReport},
		merge::MergeVerdict,
	},
};

fn key_value(rows: Vec<(&str, String)>) -> Table {
	let mut table = Table::new();
	table.load_preset(UTF8_BORDERS_ONLY);
	table.set_header(vec!["Key", "Value"]);
	for (key, value) in rows {
		table.add_row(vec![key.to_string(), value]);
	}
	table
}

pub fn discovery(report: &DiscoveryReport) -> Table {
	key_value(vec![
		("packages", report.packages.to_string()),
		("scanned", report.scanned.to_string()),
		("new", report.new_files.to_string()),
		("changed", report.changed.to_string()),
		("touched", report.touched.to_string()),
		("unchanged", report.unchanged.to_string()),
		("skipped", report.skipped.to_string()),
		("deleted", report.deleted.to_string()),
		("enqueued", report.enqueued.to_string()),
		("versions", report.versions_created.to_string()),
	])
}

pub fn build(report: &PoolReport) -> Table {
	key_value(vec![
		("committed", report.committed.to_string()),
		("stale", report.stale.to_string()),
		("failed", report.failed.to_string()),
		("requeued", report.requeued.to_string()),
		("timed out", report.timed_out.to_string()),
		("workers replaced", report.workers_replaced.to_string()),
	])
}

pub fn queue(stats: &QueueStats, daemon: Option<&DaemonStatus>) -> Table {
	let mut rows = Vec::new();
	match daemon {
		Some(status) => {
			rows.push(("daemon", format!("{} (pid {})", status.state, status.pid)));
			rows.push(("started", status.started_at.to_rfc3339()));
			rows.push(("workers", status.workers.to_string()));
		}
		None => rows.push(("daemon", "not running".to_string())),
	}
	rows.extend([
		("pending", stats.pending.to_string()),
		("claimed", stats.claimed.to_string()),
		("processing", stats.processing.to_string()),
		("completed", stats.completed.to_string()),
		("stale", stats.stale.to_string()),
		("error", stats.error.to_string()),
		(
			"last build",
			stats
				.last_build_id
				.map_or_else(|| "-".to_string(), |id| id.to_string()),
		),
	]);
	key_value(rows)
}

pub fn conflicts(verdicts: &[&MergeVerdict]) -> Table {
	let mut table = Table::new();
	table.load_preset(UTF8_BORDERS_ONLY);
	table.set_header(vec!["Identity", "Policy", "Risk", "Winner", "Losers", "Reason"]);
	for verdict in verdicts {
		let losers: Vec<&str> = verdict.losers.iter().map(|l| l.package.as_str()).collect();
		table.add_row(vec![
			verdict.identity.to_string(),
			verdict.policy.to_string(),
			verdict.risk.to_string(),
			format!("{} ({})", verdict.winner.package, verdict.winner.file),
			losers.join(", "),
			verdict.risk_reason.clone(),
		]);
	}
	table
}
