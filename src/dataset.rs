use crate::error::{ReflectError, ReflectResult};
use std::path::{Path, PathBuf};

pub const SAMPLES_SUBDIR: &str = "others";
pub const AMBIENT_SUFFIX: &str = "ambient.jpg";
pub const FLASH_SUFFIX: &str = "flash.jpg";
pub const PUREFLASH_SUFFIX: &str = "pureflash.jpg";

/// The three captures of one scene, named after a shared stem:
/// `<stem>ambient.jpg`, `<stem>flash.jpg` and `<stem>pureflash.jpg`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleTriplet {
	pub stem: String,
	pub ambient: PathBuf,
	pub flash: PathBuf,
	pub pureflash: PathBuf,
}

impl SampleTriplet {
	pub fn from_ambient(ambient: impl AsRef<Path>) -> ReflectResult<Self> {
		let ambient = ambient.as_ref();
		let file_name = ambient
			.file_name()
			.and_then(|s| s.to_str())
			.ok_or_else(|| ReflectError::IoError(format!("Invalid sample path: {:?}", ambient)))?;

		let stem = file_name.strip_suffix(AMBIENT_SUFFIX).ok_or_else(|| {
			ReflectError::ImageError(format!(
				"Sample {:?} does not end with {}",
				ambient, AMBIENT_SUFFIX
			))
		})?;

		let sibling = |suffix: &str| ambient.with_file_name(format!("{}{}", stem, suffix));

		Ok(Self {
			stem: stem.to_string(),
			ambient: ambient.to_path_buf(),
			flash: sibling(FLASH_SUFFIX),
			pureflash: sibling(PUREFLASH_SUFFIX),
		})
	}

	/// Output file for this sample, e.g. `<dir>/<stem>_1_pred_transmission.png`.
	pub fn output_path(&self, dir: &Path, suffix: &str) -> PathBuf {
		dir.join(format!("{}{}", self.stem, suffix))
	}
}

/// Collect every `<testset>/others/*ambient.jpg`, sorted by path.
///
/// Hidden files are skipped, as a shell glob would. A missing `others`
/// directory yields no samples.
pub fn discover_samples(testset: impl AsRef<Path>) -> ReflectResult<Vec<SampleTriplet>> {
	let data_dir = testset.as_ref().join(SAMPLES_SUBDIR);
	if !data_dir.is_dir() {
		tracing::warn!("No sample directory at {:?}", data_dir);
		return Ok(Vec::new());
	}

	let mut ambients = Vec::new();
	for entry in std::fs::read_dir(&data_dir)
		.map_err(|e| ReflectError::IoError(format!("Failed to list {:?}: {}", data_dir, e)))?
	{
		let path = entry?.path();
		let is_ambient = path
			.file_name()
			.and_then(|s| s.to_str())
			.map(|name| !name.starts_with('.') && name.ends_with(AMBIENT_SUFFIX))
			.unwrap_or(false);
		if is_ambient && path.is_file() {
			ambients.push(path);
		}
	}
	ambients.sort();

	ambients.iter().map(SampleTriplet::from_ambient).collect()
}

/// Name of the output subdirectory for a test set: its last path component.
pub fn dataset_leaf(testset: &Path) -> String {
	testset
		.file_name()
		.and_then(|s| s.to_str())
		.unwrap_or("testset")
		.to_string()
}
