use anyhow::{Context as _, Result};
use std::path::PathBuf;
use strata_core::{
	config::CoreConfig,
	infra::daemon::{
		ensure_daemon, ClientError, DaemonClient, DaemonRequest, DaemonResponse, ProcessSpawner,
		WriterLockGuard,
	},
	Core,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
	Human,
	Json,
}

pub struct Context {
	pub config: CoreConfig,
	pub format: OutputFormat,
}

impl Context {
	pub fn load(data_dir: Option<PathBuf>, format: OutputFormat) -> Result<Self> {
		let config = match data_dir {
			Some(dir) => CoreConfig::load_from(&dir),
			None => CoreConfig::load(),
		}
		.context("failed to load configuration")?;
		Ok(Self { config, format })
	}

	pub fn client(&self) -> DaemonClient {
		DaemonClient::new(self.config.socket_path(), self.config.ipc.request_timeout())
	}

	/// Send a request to a running daemon. `Ok(None)` means no daemon
	/// answered and the caller should run the no-daemon path.
	pub async fn try_daemon(&self, request: &DaemonRequest) -> Result<Option<DaemonResponse>> {
		match self.client().send(request).await {
			Ok(DaemonResponse::Error(message)) => anyhow::bail!("daemon: {message}"),
			Ok(response) => Ok(Some(response)),
			Err(e) if e.is_unavailable() => {
				debug!("No daemon available: {}", e);
				Ok(None)
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Send a request, starting a daemon first if none is running
	pub async fn via_daemon(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
		let spawner = ProcessSpawner::current_exe().context("cannot locate own executable")?;
		let client = ensure_daemon(&self.config, &spawner).await?;
		match client.send(request).await {
			Ok(DaemonResponse::Error(message)) => anyhow::bail!("daemon: {message}"),
			Ok(response) => Ok(response),
			Err(e @ ClientError::Timeout(_)) => Err(e).context("daemon did not answer in time"),
			Err(e) => Err(e.into()),
		}
	}

	/// Take the writer lock, then open the store for a one-shot command
	pub async fn open_writer(&self) -> Result<(Core, WriterLockGuard)> {
		Ok(Core::open_writer(self.config.clone()).await?)
	}

	pub async fn open_reader(&self) -> Result<Core> {
		Ok(Core::open_reader(self.config.clone()).await?)
	}
}
