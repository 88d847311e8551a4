use anyhow::Context;
use clap::Parser;
use flash_reflect::config::{DEFAULT_CKPT_ROOT, DEFAULT_MODEL, DEFAULT_SEED, DEFAULT_TESTSET, DEFAULT_THREADS};
use flash_reflect::{process_testset, CheckpointStatus, RunConfig, RuntimeConfig, SampleProgress};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "flash-reflect")]
#[command(about = "Remove reflections and flash shadows from ambient/flash photo triplets")]
#[command(version)]
struct Cli {
	/// Model name, selects the checkpoint directory <ckpt-root>/<model>
	#[arg(long, default_value = DEFAULT_MODEL)]
	model: String,

	/// Test set root; samples are read from <testset>/others/*ambient.jpg
	#[arg(long, default_value = DEFAULT_TESTSET)]
	testset: PathBuf,

	/// Directory holding one subdirectory per model
	#[arg(long, default_value = DEFAULT_CKPT_ROOT)]
	ckpt_root: PathBuf,

	/// GPU index to use instead of the one with the most free memory
	#[arg(long)]
	gpu: Option<u32>,

	/// Worker threads for the numeric kernels
	#[arg(long, default_value_t = DEFAULT_THREADS)]
	threads: usize,

	/// Seed for parameters that no checkpoint overrides
	#[arg(long, default_value_t = DEFAULT_SEED)]
	seed: u64,

	/// Also write the predicted reflection layer and the shadow mask
	#[arg(long)]
	save_extra: bool,

	/// Enable debug logging
	#[arg(short, long)]
	verbose: bool,
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	let log_level = if cli.verbose { "debug" } else { "info" };
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| format!("flash_reflect={log_level}").into()),
		)
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();

	if let Err(err) = run(cli) {
		tracing::error!("{err:#}");
		return ExitCode::FAILURE;
	}

	ExitCode::SUCCESS
}

fn run(cli: Cli) -> anyhow::Result<()> {
	tracing::debug!("{:?}", cli);

	let runtime_config = RuntimeConfig {
		gpu: cli.gpu,
		threads: cli.threads,
		seed: cli.seed,
	};
	let config = RunConfig {
		model: cli.model,
		testset: cli.testset,
		ckpt_root: cli.ckpt_root,
		save_extra: cli.save_extra,
	};

	let start = std::time::Instant::now();
	let summary = process_testset(
		&config,
		&runtime_config,
		Some(Box::new(|progress: SampleProgress| {
			eprint!(
				"\r[{}] Sample {}/{} ({:.1}%)",
				progress.name, progress.current, progress.total, progress.percent
			);
		})),
	)
	.with_context(|| format!("Failed to process test set {}", config.testset.display()))?;

	if summary.processed > 0 {
		eprintln!();
	}
	if summary.checkpoint == CheckpointStatus::NotFound {
		tracing::warn!("Ran with untrained parameters; outputs are not meaningful");
	}
	eprintln!(
		"✓ {} samples written to {:?} in {:.1}s",
		summary.processed,
		summary.output_dir,
		start.elapsed().as_secs_f64()
	);

	Ok(())
}
