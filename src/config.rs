use crate::dataset::dataset_leaf;
use crate::error::{ReflectError, ReflectResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "full_global_lp";
pub const DEFAULT_TESTSET: &str = "./data/demo";
pub const DEFAULT_CKPT_ROOT: &str = "./ckpt";
pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_SEED: u64 = 2019;

/// Parameter layout understood by this build. Bumped whenever block or
/// parameter names change.
pub const LAYOUT_VERSION: u32 = 1;

pub const NETWORK_CONFIG_FILE: &str = "config.json";

/// Process-wide settings consumed once by [`crate::device::init_runtime`].
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
	/// Explicit GPU index; `None` picks the device with the most free memory.
	pub gpu: Option<u32>,
	pub threads: usize,
	pub seed: u64,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			gpu: None,
			threads: DEFAULT_THREADS,
			seed: DEFAULT_SEED,
		}
	}
}

#[derive(Clone, Debug)]
pub struct RunConfig {
	pub model: String,
	pub testset: PathBuf,
	pub ckpt_root: PathBuf,
	/// Also write the predicted reflection layer and the shadow mask.
	pub save_extra: bool,
}

impl Default for RunConfig {
	fn default() -> Self {
		Self {
			model: DEFAULT_MODEL.to_string(),
			testset: PathBuf::from(DEFAULT_TESTSET),
			ckpt_root: PathBuf::from(DEFAULT_CKPT_ROOT),
			save_extra: false,
		}
	}
}

impl RunConfig {
	pub fn model_dir(&self) -> PathBuf {
		self.ckpt_root.join(&self.model)
	}

	/// `<ckpt_root>/<model>/<dataset leaf>`
	pub fn output_dir(&self) -> PathBuf {
		self.model_dir().join(dataset_leaf(&self.testset))
	}
}

/// Architecture hyper-parameters shared by both network stages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
	/// Width of the first encoder level; each level below doubles it.
	pub base_channels: usize,
	pub se_reduction: usize,
	pub layout_version: u32,
}

impl Default for NetworkConfig {
	fn default() -> Self {
		Self {
			base_channels: 32,
			se_reduction: 16,
			layout_version: LAYOUT_VERSION,
		}
	}
}

impl NetworkConfig {
	/// Read `config.json` from a model directory, falling back to the
	/// defaults when the file does not exist.
	pub fn load(model_dir: impl AsRef<Path>) -> ReflectResult<Self> {
		let path = model_dir.as_ref().join(NETWORK_CONFIG_FILE);
		if !path.exists() {
			tracing::debug!("No {} in {:?}, using default network", NETWORK_CONFIG_FILE, model_dir.as_ref());
			return Ok(Self::default());
		}

		let text = std::fs::read_to_string(&path)
			.map_err(|e| ReflectError::IoError(format!("Failed to read {:?}: {}", path, e)))?;
		let config: NetworkConfig = serde_json::from_str(&text)
			.map_err(|e| ReflectError::ConfigError(format!("Invalid {:?}: {}", path, e)))?;
		config.validate()?;
		Ok(config)
	}

	pub fn save(&self, model_dir: impl AsRef<Path>) -> ReflectResult<()> {
		std::fs::create_dir_all(model_dir.as_ref())?;
		let path = model_dir.as_ref().join(NETWORK_CONFIG_FILE);
		std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
		Ok(())
	}

	pub fn validate(&self) -> ReflectResult<()> {
		if self.layout_version != LAYOUT_VERSION {
			return Err(ReflectError::ConfigError(format!(
				"Unsupported parameter layout version {} (expected {})",
				self.layout_version, LAYOUT_VERSION
			)));
		}
		if self.base_channels == 0 {
			return Err(ReflectError::ConfigError(
				"base_channels must be at least 1".to_string(),
			));
		}
		if self.se_reduction == 0 {
			return Err(ReflectError::ConfigError(
				"se_reduction must be at least 1".to_string(),
			));
		}
		Ok(())
	}
}
