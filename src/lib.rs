pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod image_loader;
pub mod mask;
pub mod model;
pub mod network;
pub mod output;
pub mod removal;
pub mod runner;

pub use config::{NetworkConfig, RunConfig, RuntimeConfig};
pub use device::{init_runtime, Runtime};
pub use error::{ReflectError, ReflectResult};
pub use model::{CheckpointStatus, CheckpointStore};
pub use removal::{FlashReflectionRemover, Prediction};
pub use runner::{run_inference, ProgressCallback, RunSummary, SampleProgress};

/// Initialize the process runtime and run every sample of a test set.
pub fn process_testset(
	config: &RunConfig,
	runtime_config: &RuntimeConfig,
	progress: Option<ProgressCallback>,
) -> ReflectResult<RunSummary> {
	let runtime = init_runtime(runtime_config)?;
	run_inference(config, runtime, progress)
}
