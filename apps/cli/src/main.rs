use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::{path::PathBuf, sync::Arc};
use strata_core::{
	config::{CoreConfig, PackageConfig},
	infra::{
		daemon::{init_daemon_tracing, Daemon, DaemonExit, DaemonRequest, DaemonResponse},
		queue::Priority,
		store::ContentStore,
	},
	ops::{
		indexing::{pool::run_worker_stdio, ScriptExecutor},
		merge::RiskLevel,
	},
};
use tracing::info;

mod context;
mod output;

use context::{Context, OutputFormat};

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Incremental script indexer and merge resolver")]
struct Cli {
	/// Path to the strata data directory
	#[arg(long, env = "STRATA_DATA_DIR", global = true)]
	data_dir: Option<PathBuf>,

	/// Output format
	#[arg(long, value_enum, default_value = "human", global = true)]
	format: OutputFormat,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Create or update the configuration
	Init(InitArgs),
	/// Scan every package and enqueue changed files
	Discover {
		/// Rehash files even when size and mtime are unchanged
		#[arg(long, default_value_t = false)]
		force_hash: bool,
		/// Start a daemon if none is running and hand the scan to it
		#[arg(long, default_value_t = false)]
		spawn: bool,
	},
	/// Run the writer daemon in the foreground
	Daemon,
	/// Drain the queue once without a daemon
	Build,
	/// Queue and daemon status
	Status,
	/// Enqueue a single file at flash priority
	Enqueue {
		package: String,
		path: PathBuf,
		#[arg(long, value_enum, default_value = "flash")]
		priority: PriorityArg,
	},
	/// Ask the daemon to drain and stop
	Shutdown,
	/// Identities defined by more than one package
	Conflicts {
		/// Lowest risk level to show
		#[arg(long, value_enum, default_value = "info")]
		min_risk: RiskArg,
	},
	/// Worker process speaking JSON lines on stdin/stdout
	#[command(hide = true)]
	Worker,
}

#[derive(Parser, Debug, Clone)]
struct InitArgs {
	/// Base game directory
	#[arg(long)]
	game: Option<PathBuf>,
	/// Override packages in load order, as NAME=PATH
	#[arg(long = "package", value_parser = parse_package)]
	packages: Vec<PackageConfig>,
}

fn parse_package(raw: &str) -> Result<PackageConfig, String> {
	let (name, path) = raw
		.split_once('=')
		.ok_or_else(|| format!("expected NAME=PATH, got '{raw}'"))?;
	Ok(PackageConfig {
		name: name.trim().to_string(),
		path: PathBuf::from(path.trim()),
		replace_paths: Vec::new(),
	})
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
	Normal,
	Flash,
}

impl From<PriorityArg> for Priority {
	fn from(p: PriorityArg) -> Self {
		match p {
			PriorityArg::Normal => Priority::Normal,
			PriorityArg::Flash => Priority::Flash,
		}
	}
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RiskArg {
	Info,
	Minor,
	Major,
	Critical,
}

impl From<RiskArg> for RiskLevel {
	fn from(r: RiskArg) -> Self {
		match r {
			RiskArg::Info => RiskLevel::Info,
			RiskArg::Minor => RiskLevel::Minor,
			RiskArg::Major => RiskLevel::Major,
			RiskArg::Critical => RiskLevel::Critical,
		}
	}
}

fn init_cli_tracing() {
	use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

	let _ = tracing_subscriber::registry()
		.with(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("strata_core=warn,strata=info")),
		)
		.with(fmt::layer().with_target(false).with_writer(std::io::stderr))
		.try_init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	// The daemon installs its own subscriber with a file layer
	if !matches!(cli.command, Commands::Daemon) {
		init_cli_tracing();
	}

	match cli.command {
		Commands::Init(args) => init(cli.data_dir, args, cli.format),
		Commands::Daemon => daemon(Context::load(cli.data_dir, cli.format)?).await,
		Commands::Worker => worker(Context::load(cli.data_dir, cli.format)?).await,
		command => {
			let ctx = Context::load(cli.data_dir, cli.format)?;
			run(&ctx, command).await
		}
	}
}

fn init(data_dir: Option<PathBuf>, args: InitArgs, format: OutputFormat) -> Result<()> {
	let data_dir = match data_dir {
		Some(dir) => dir,
		None => strata_core::config::default_data_dir()?,
	};
	let mut config = CoreConfig::load_or_create(&data_dir)?;
	if let Some(game) = args.game {
		config.game.path = game;
	}
	if !args.packages.is_empty() {
		config.packages = args.packages;
	}
	config.validate()?;
	config.ensure_directories()?;
	config.save()?;

	match format {
		OutputFormat::Human => {
			println!("Initialized {}", config.data_dir.display());
			for (index, package) in config.load_order().enumerate() {
				println!("  {index}. {} -> {}", package.name, config.package_root(package).display());
			}
		}
		OutputFormat::Json => print_json(&config)?,
	}
	Ok(())
}

async fn daemon(ctx: Context) -> Result<()> {
	let _log_guard = init_daemon_tracing(&ctx.config.logs_dir(), &ctx.config.log_level)?;

	let daemon = Daemon::new(ctx.config);
	let shutdown = daemon.shutdown_token();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("Interrupted, draining");
			shutdown.cancel();
		}
	});

	match daemon.run().await? {
		DaemonExit::Stopped(report) => {
			info!(?report, "Daemon stopped");
			Ok(())
		}
		DaemonExit::AlreadyRunning(record) => anyhow::bail!(
			"another daemon (pid {}) holds the writer lock, endpoint {}",
			record.pid,
			record.endpoint.display()
		),
	}
}

async fn worker(ctx: Context) -> Result<()> {
	let executor = Arc::new(ScriptExecutor::new(ContentStore::new(ctx.config.blobs_dir())));
	run_worker_stdio(executor)
		.await
		.context("worker loop failed")
}

async fn run(ctx: &Context, command: Commands) -> Result<()> {
	match command {
		Commands::Discover { force_hash, spawn } => {
			let request = DaemonRequest::Discover { force_hash };
			let response = if spawn {
				Some(ctx.via_daemon(&request).await?)
			} else {
				ctx.try_daemon(&request).await?
			};

			let report = match response {
				Some(DaemonResponse::Discovered(report)) => report,
				Some(other) => anyhow::bail!("unexpected daemon response: {other:?}"),
				None => {
					let (core, guard) = ctx.open_writer().await?;
					let report = core.discover(force_hash).await;
					guard.release().await?;
					report?
				}
			};

			match ctx.format {
				OutputFormat::Human => println!("{}", output::discovery(&report)),
				OutputFormat::Json => print_json(&report)?,
			}
		}

		Commands::Build => {
			if ctx.client().ping().await {
				anyhow::bail!("a daemon is running and builds continuously; see `strata status`");
			}
			let (core, guard) = ctx.open_writer().await?;
			let report = core.build().await;
			guard.release().await?;
			let report = report?;

			match ctx.format {
				OutputFormat::Human => println!("{}", output::build(&report)),
				OutputFormat::Json => print_json(&report)?,
			}
		}

		Commands::Status => match ctx.try_daemon(&DaemonRequest::Status).await? {
			Some(DaemonResponse::Status(status)) => match ctx.format {
				OutputFormat::Human => println!("{}", output::queue(&status.queue, Some(&status))),
				OutputFormat::Json => print_json(&status)?,
			},
			Some(other) => anyhow::bail!("unexpected daemon response: {other:?}"),
			None => {
				let stats = ctx.open_reader().await?.status().await?;
				match ctx.format {
					OutputFormat::Human => println!("{}", output::queue(&stats, None)),
					OutputFormat::Json => print_json(&stats)?,
				}
			}
		},

		Commands::Enqueue {
			package,
			path,
			priority,
		} => {
			let request = DaemonRequest::Enqueue {
				package: package.clone(),
				path: path.clone(),
				priority: priority.into(),
			};
			let build_id = match ctx.try_daemon(&request).await? {
				Some(DaemonResponse::Enqueued { build_id }) => Some(build_id),
				Some(DaemonResponse::NotRouted) => None,
				Some(other) => anyhow::bail!("unexpected daemon response: {other:?}"),
				None => {
					let (core, guard) = ctx.open_writer().await?;
					let result = core.enqueue_path(&package, &path, priority.into()).await;
					guard.release().await?;
					result?
				}
			};

			match (ctx.format, build_id) {
				(OutputFormat::Human, Some(build_id)) => println!("Enqueued build {build_id}"),
				(OutputFormat::Human, None) => println!("{} is not routed, nothing to do", path.display()),
				(OutputFormat::Json, build_id) => print_json(&serde_json::json!({ "build_id": build_id }))?,
			}
		}

		Commands::Shutdown => match ctx.try_daemon(&DaemonRequest::Shutdown).await? {
			Some(_) => println!("Daemon is shutting down"),
			None => println!("No daemon running"),
		},

		Commands::Conflicts { min_risk } => {
			let verdicts = ctx.open_reader().await?.resolve().await?;
			let min_risk = RiskLevel::from(min_risk);
			let shown: Vec<_> = verdicts
				.iter()
				.filter(|v| v.is_conflict() && v.risk >= min_risk)
				.collect();

			match ctx.format {
				OutputFormat::Human => {
					if shown.is_empty() {
						println!("No conflicts");
					} else {
						println!("{}", output::conflicts(&shown));
					}
				}
				OutputFormat::Json => print_json(&shown)?,
			}
		}

		Commands::Init(_) | Commands::Daemon | Commands::Worker => {}
	}

	Ok(())
}
