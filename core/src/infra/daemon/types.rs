//! Wire types of the daemon socket: one JSON request per line, one JSON
//! response per line.

use super::state::DaemonState;
use crate::{
	infra::queue::{BuildId, Priority, QueueStats},
	ops::indexing::DiscoveryReport,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonRequest {
	Ping,
	Enqueue {
		package: String,
		path: PathBuf,
		priority: Priority,
	},
	Discover {
		force_hash: bool,
	},
	Status,
	Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonResponse {
	Pong,
	Enqueued { build_id: BuildId },
	/// The path routes to `skip`
	NotRouted,
	Discovered(DiscoveryReport),
	Status(DaemonStatus),
	Ok,
	Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
	pub state: DaemonState,
	pub pid: u32,
	pub started_at: DateTime<Utc>,
	pub workers: usize,
	pub queue: QueueStats,
}
