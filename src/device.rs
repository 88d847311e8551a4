use crate::config::RuntimeConfig;
use crate::error::{ReflectError, ReflectResult};
use candle_core::Device;
use std::sync::OnceLock;

#[cfg(feature = "cuda")]
const MIB: u64 = 1024 * 1024;

pub const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";
pub const OMP_THREADS_VAR: &str = "OMP_NUM_THREADS";
pub const RAYON_THREADS_VAR: &str = "RAYON_NUM_THREADS";

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuMemory {
	pub index: u32,
	pub free_mib: u64,
}

/// Process-wide state established once before any model is built.
#[derive(Clone, Debug)]
pub struct Runtime {
	pub gpu_index: u32,
	pub device: Device,
	pub seed: u64,
}

/// Free memory of every NVIDIA device, in NVML enumeration order.
#[cfg(feature = "cuda")]
pub fn gpu_inventory() -> ReflectResult<Vec<GpuMemory>> {
	use nvml_wrapper::Nvml;

	let nvml = Nvml::init().map_err(nvml_error)?;
	let count = nvml.device_count().map_err(nvml_error)?;
	(0..count)
		.map(|index| {
			let memory = nvml
				.device_by_index(index)
				.and_then(|device| device.memory_info())
				.map_err(nvml_error)?;
			Ok(GpuMemory {
				index,
				free_mib: memory.free / MIB,
			})
		})
		.collect()
}

#[cfg(not(feature = "cuda"))]
pub fn gpu_inventory() -> ReflectResult<Vec<GpuMemory>> {
	Err(ReflectError::DeviceError(
		"GPU inventory requires the `cuda` feature".to_string(),
	))
}

#[cfg(feature = "cuda")]
fn nvml_error(e: nvml_wrapper::error::NvmlError) -> ReflectError {
	ReflectError::DeviceError(format!("NVML: {}", e))
}

/// Index with the most free memory; the first listed wins ties.
pub fn pick_most_free(inventory: &[GpuMemory]) -> Option<u32> {
	inventory
		.iter()
		.fold(None::<&GpuMemory>, |best, gpu| match best {
			Some(b) if b.free_mib >= gpu.free_mib => Some(b),
			_ => Some(gpu),
		})
		.map(|gpu| gpu.index)
}

pub fn query_free_gpu() -> ReflectResult<u32> {
	let inventory = gpu_inventory()?;
	tracing::debug!("GPU inventory: {:?}", inventory);
	pick_most_free(&inventory)
		.ok_or_else(|| ReflectError::DeviceError("No GPU memory information found.".to_string()))
}

/// GPU with the most free memory, or 0 when the inventory cannot be read.
pub fn select_device() -> u32 {
	match query_free_gpu() {
		Ok(index) => index,
		Err(e) => {
			tracing::warn!("Error selecting GPU: {}", e);
			0
		}
	}
}

/// Apply `config` to the process: device visibility, thread counts and the
/// compute device. Only the first call has any effect; later calls return the
/// runtime established by the first.
pub fn init_runtime(config: &RuntimeConfig) -> ReflectResult<&'static Runtime> {
	if let Some(runtime) = RUNTIME.get() {
		tracing::debug!("Runtime already initialized, ignoring new configuration");
		return Ok(runtime);
	}

	if config.threads == 0 {
		return Err(ReflectError::ConfigError(
			"thread count must be at least 1".to_string(),
		));
	}

	let gpu_index = config.gpu.unwrap_or_else(select_device);
	std::env::set_var(VISIBLE_DEVICES_VAR, gpu_index.to_string());
	std::env::set_var(OMP_THREADS_VAR, config.threads.to_string());
	std::env::set_var(RAYON_THREADS_VAR, config.threads.to_string());
	tracing::info!("Using GPU: {}", gpu_index);

	if let Err(e) = rayon::ThreadPoolBuilder::new()
		.num_threads(config.threads)
		.build_global()
	{
		tracing::debug!("Global thread pool already configured: {}", e);
	}

	let runtime = Runtime {
		gpu_index,
		device: compute_device(),
		seed: config.seed,
	};
	Ok(RUNTIME.get_or_init(|| runtime))
}

// Only the selected GPU is visible, so it is always CUDA ordinal 0.
fn compute_device() -> Device {
	match Device::cuda_if_available(0) {
		Ok(device) => device,
		Err(e) => {
			tracing::warn!("CUDA device unavailable ({}), falling back to CPU", e);
			Device::Cpu
		}
	}
}
