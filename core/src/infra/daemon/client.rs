use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::infra::daemon::types::{DaemonRequest, DaemonResponse};

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("daemon unreachable at {path}: {source}")]
	Unreachable {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("daemon did not answer within {0:?}")]
	Timeout(Duration),
	#[error("daemon connection failed: {0}")]
	Io(#[from] io::Error),
	#[error("malformed daemon message: {0}")]
	Protocol(#[from] serde_json::Error),
	#[error("daemon closed the connection without answering")]
	Closed,
}

impl ClientError {
	/// The caller may fall back to running without a daemon
	pub fn is_unavailable(&self) -> bool {
		matches!(self, Self::Unreachable { .. } | Self::Timeout(_) | Self::Closed)
	}
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
	socket_path: PathBuf,
	request_timeout: Duration,
}

impl DaemonClient {
	pub fn new(socket_path: impl Into<PathBuf>, request_timeout: Duration) -> Self {
		Self {
			socket_path: socket_path.into(),
			request_timeout,
		}
	}

	pub fn socket_path(&self) -> &Path {
		&self.socket_path
	}

	/// One request, one response, bounded by the request timeout
	pub async fn send(&self, request: &DaemonRequest) -> Result<DaemonResponse, ClientError> {
		timeout(self.request_timeout, self.exchange(request))
			.await
			.map_err(|_| ClientError::Timeout(self.request_timeout))?
	}

	/// Whether a daemon answers on the socket right now
	pub async fn ping(&self) -> bool {
		matches!(self.send(&DaemonRequest::Ping).await, Ok(DaemonResponse::Pong))
	}

	async fn exchange(&self, request: &DaemonRequest) -> Result<DaemonResponse, ClientError> {
		let stream =
			UnixStream::connect(&self.socket_path)
				.await
				.map_err(|source| ClientError::Unreachable {
					path: self.socket_path.clone(),
					source,
				})?;
		let (reader, mut writer) = stream.into_split();

		let mut payload = serde_json::to_string(request)?;
		payload.push('\n');
		writer.write_all(payload.as_bytes()).await?;
		writer.flush().await?;

		let mut line = String::new();
		if BufReader::new(reader).read_line(&mut line).await? == 0 {
			return Err(ClientError::Closed);
		}
		Ok(serde_json::from_str(line.trim())?)
	}
}
