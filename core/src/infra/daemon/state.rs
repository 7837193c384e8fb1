use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::watch;
use tracing::info;

/// `starting -> lock_acquired -> serving -> draining -> stopped`
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DaemonState {
	Starting,
	LockAcquired,
	Serving,
	Draining,
	Stopped,
}

/// Publishes the daemon lifecycle to anyone holding a receiver
#[derive(Debug, Clone)]
pub struct DaemonStateHandle {
	tx: watch::Sender<DaemonState>,
}

impl Default for DaemonStateHandle {
	fn default() -> Self {
		Self::new()
	}
}

impl DaemonStateHandle {
	pub fn new() -> Self {
		let (tx, _) = watch::channel(DaemonState::Starting);
		Self { tx }
	}

	pub fn get(&self) -> DaemonState {
		*self.tx.borrow()
	}

	pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
		self.tx.subscribe()
	}

	/// States only move forward
	pub fn set(&self, state: DaemonState) {
		let changed = self.tx.send_if_modified(|current| {
			if state > *current {
				*current = state;
				true
			} else {
				false
			}
		});
		if changed {
			info!(%state, "Daemon state changed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn states_never_go_back() {
		let handle = DaemonStateHandle::new();
		let rx = handle.subscribe();

		handle.set(DaemonState::Serving);
		handle.set(DaemonState::LockAcquired);
		assert_eq!(handle.get(), DaemonState::Serving);
		assert_eq!(*rx.borrow(), DaemonState::Serving);
		assert_eq!(DaemonState::LockAcquired.to_string(), "lock_acquired");
	}
}
