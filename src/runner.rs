use crate::config::{NetworkConfig, RunConfig};
use crate::dataset::{discover_samples, SampleTriplet};
use crate::device::Runtime;
use crate::error::{ReflectError, ReflectResult};
use crate::image_loader::load_triplet;
use crate::model::{load_or_init, CheckpointStatus, CheckpointStore};
use crate::output::{write_outputs, OutputKind};
use crate::removal::FlashReflectionRemover;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct SampleProgress {
	pub current: usize,
	pub total: usize,
	pub name: String,
	pub percent: f64,
}

impl SampleProgress {
	pub fn new(current: usize, total: usize, name: String) -> Self {
		let percent = if total > 0 {
			(current as f64 / total as f64 * 100.0).min(100.0)
		} else {
			0.0
		};
		Self {
			current,
			total,
			name,
			percent,
		}
	}
}

pub type ProgressCallback = Box<dyn Fn(SampleProgress) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RunSummary {
	pub processed: usize,
	pub output_dir: PathBuf,
	pub checkpoint: CheckpointStatus,
	pub written: Vec<PathBuf>,
}

/// Run one sample through the network and write its images into `output_dir`.
pub fn process_sample(
	remover: &FlashReflectionRemover,
	sample: &SampleTriplet,
	output_dir: &Path,
	save_extra: bool,
) -> ReflectResult<Vec<PathBuf>> {
	let inputs = load_triplet(sample)?;
	tracing::debug!(
		"{}: {}x{} after crop",
		sample.ambient.display(),
		inputs.width(),
		inputs.height()
	);

	let prediction = remover.forward(&inputs)?;

	let mut outputs = vec![
		(OutputKind::InputAmbient, &inputs.ambient),
		(OutputKind::PredTransmission, &prediction.transmission),
		(OutputKind::InputFlash, &inputs.flash),
		(OutputKind::InputPureflash, &inputs.pureflash),
	];
	if save_extra {
		outputs.push((OutputKind::PredReflection, &prediction.reflection));
		outputs.push((OutputKind::ShadowMask, &prediction.shadow_mask));
	}

	let targets: Vec<_> = outputs
		.into_iter()
		.map(|(kind, tensor)| (sample.output_path(output_dir, kind.suffix()), tensor))
		.collect();
	write_outputs(&targets)
}

/// Restore the model named in `config` and process every sample of its test
/// set in filename order.
pub fn run_inference(
	config: &RunConfig,
	runtime: &Runtime,
	progress: Option<ProgressCallback>,
) -> ReflectResult<RunSummary> {
	let store = CheckpointStore::new(&config.ckpt_root, &config.model);
	let network = NetworkConfig::load(store.dir())?;
	let remover = FlashReflectionRemover::new(network, &runtime.device, runtime.seed)?;
	let checkpoint = load_or_init(&store, remover.params())?;

	let samples = discover_samples(&config.testset)?;
	tracing::info!("{} samples in {}", samples.len(), config.testset.display());

	let output_dir = config.output_dir();
	std::fs::create_dir_all(&output_dir).map_err(|e| {
		ReflectError::IoError(format!(
			"Failed to create output directory {:?}: {}",
			output_dir, e
		))
	})?;
	tracing::info!("output path: {}", output_dir.display());

	let total = samples.len();
	let mut written = Vec::with_capacity(total * 4);
	for (i, sample) in samples.iter().enumerate() {
		let start = Instant::now();
		written.extend(process_sample(&remover, sample, &output_dir, config.save_extra)?);
		tracing::debug!(
			"{} done in {:.2}s",
			sample.ambient.display(),
			start.elapsed().as_secs_f64()
		);

		if let Some(ref callback) = progress {
			callback(SampleProgress::new(i + 1, total, sample.stem.clone()));
		}
	}

	Ok(RunSummary {
		processed: total,
		output_dir,
		checkpoint,
		written,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_progress_percent() {
		assert_eq!(SampleProgress::new(1, 4, "a".into()).percent, 25.0);
		assert_eq!(SampleProgress::new(0, 0, "a".into()).percent, 0.0);
		assert_eq!(SampleProgress::new(5, 4, "a".into()).percent, 100.0);
	}
}
