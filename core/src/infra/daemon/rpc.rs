use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn, Instrument};

use crate::infra::daemon::types::{DaemonRequest, DaemonResponse, DaemonStatus};
use crate::infra::daemon::DaemonShared;

/// JSON-lines RPC server on a Unix domain socket
pub struct RpcServer {
	socket_path: PathBuf,
	shared: Arc<DaemonShared>,
	/// Connections currently being served
	connection_count: Arc<AtomicUsize>,
	max_connections: usize,
}

impl RpcServer {
	pub fn new(socket_path: PathBuf, shared: Arc<DaemonShared>) -> Self {
		Self {
			socket_path,
			shared,
			connection_count: Arc::new(AtomicUsize::new(0)),
			max_connections: 64,
		}
	}

	/// Bind the socket. Only the lock holder calls this, so a leftover socket
	/// file belongs to a dead daemon and is replaced.
	pub fn bind(&self) -> io::Result<UnixListener> {
		match std::fs::remove_file(&self.socket_path) {
			Ok(()) => debug!("Removed leftover socket file"),
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => return Err(e),
		}
		if let Some(parent) = self.socket_path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let listener = UnixListener::bind(&self.socket_path)?;
		info!(socket = %self.socket_path.display(), "RPC server bound");
		Ok(listener)
	}

	/// Accept connections until the daemon starts draining.
	pub async fn serve(&self, listener: UnixListener) {
		let shutdown = self.shared.shutdown.clone();

		loop {
			tokio::select! {
				result = listener.accept() => match result {
					Ok((mut stream, _addr)) => {
						let current = self.connection_count.load(Ordering::Relaxed);
						if current >= self.max_connections {
							warn!(limit = self.max_connections, "Connection limit reached, rejecting");
							let _ = stream.shutdown().await;
							continue;
						}

						let shared = Arc::clone(&self.shared);
						let connection_count = Arc::clone(&self.connection_count);
						connection_count.fetch_add(1, Ordering::Relaxed);

						tokio::spawn(
							async move {
								if let Err(e) = Self::handle_connection(stream, &shared).await {
									debug!("Connection closed with error: {}", e);
								}
								connection_count.fetch_sub(1, Ordering::Relaxed);
							}
							.instrument(tracing::debug_span!("rpc_connection")),
						);
					}
					Err(e) => {
						// EMFILE
						if e.raw_os_error() == Some(24) {
							error!("Too many open files, connections: {}", self.connection_count.load(Ordering::Relaxed));
						} else {
							error!("Accept error: {}", e);
						}
					}
				},
				_ = shutdown.cancelled() => {
					info!("RPC server stopping");
					break;
				}
			}
		}

		if let Err(e) = std::fs::remove_file(&self.socket_path) {
			if e.kind() != io::ErrorKind::NotFound {
				warn!("Failed to remove socket file: {}", e);
			}
		}
	}

	/// Serve requests on one connection until the client hangs up.
	async fn handle_connection(stream: UnixStream, shared: &DaemonShared) -> io::Result<()> {
		let (reader, mut writer) = stream.into_split();
		let mut lines = BufReader::new(reader).lines();

		while let Some(line) = lines.next_line().await? {
			let line = line.trim();
			if line.is_empty() {
				continue;
			}

			let response = match serde_json::from_str::<DaemonRequest>(line) {
				Ok(request) => Self::process_request(request, shared).await,
				Err(e) => {
					warn!("Failed to parse daemon request: {}", e);
					DaemonResponse::Error(format!("invalid request: {e}"))
				}
			};

			let mut payload = serde_json::to_string(&response).map_err(io::Error::other)?;
			payload.push('\n');
			writer.write_all(payload.as_bytes()).await?;
			writer.flush().await?;
		}

		Ok(())
	}

	/// Connection handlers only enqueue, discover through the writer path,
	/// read status or signal shutdown.
	pub async fn process_request(request: DaemonRequest, shared: &DaemonShared) -> DaemonResponse {
		debug!(?request, "RPC request");
		match request {
			DaemonRequest::Ping => DaemonResponse::Pong,

			DaemonRequest::Enqueue {
				package,
				path,
				priority,
			} => match shared.core.enqueue_path(&package, &path, priority).await {
				Ok(Some(build_id)) => {
					shared.wake.notify_one();
					DaemonResponse::Enqueued { build_id }
				}
				Ok(None) => DaemonResponse::NotRouted,
				Err(e) => DaemonResponse::Error(e.to_string()),
			},

			DaemonRequest::Discover { force_hash } => match shared.core.discover(force_hash).await {
				Ok(report) => {
					shared.wake.notify_one();
					DaemonResponse::Discovered(report)
				}
				Err(e) => DaemonResponse::Error(e.to_string()),
			},

			DaemonRequest::Status => match shared.core.status().await {
				Ok(queue) => DaemonResponse::Status(DaemonStatus {
					state: shared.state.get(),
					pid: std::process::id(),
					started_at: shared.started_at,
					workers: shared.workers,
					queue,
				}),
				Err(e) => DaemonResponse::Error(e.to_string()),
			},

			DaemonRequest::Shutdown => {
				info!("Shutdown requested over RPC");
				shared.shutdown.cancel();
				DaemonResponse::Ok
			}
		}
	}
}
