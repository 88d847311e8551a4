use crate::error::{ReflectError, ReflectResult};
use candle_core::{DType, Device};
use candle_nn::VarMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Name of the state file listing the snapshots of a model directory.
pub const STATE_FILE: &str = "checkpoint";
pub const SNAPSHOT_EXTENSION: &str = "safetensors";
/// Snapshots referenced by the state file before the oldest is dropped.
pub const MAX_TO_KEEP: usize = 20;

const LATEST_KEY: &str = "model_checkpoint_path";
const ALL_KEY: &str = "all_model_checkpoint_paths";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointStatus {
	Loaded(PathBuf),
	NotFound,
}

/// Contents of the state file, in the `key: "value"` text format:
///
/// ```text
/// model_checkpoint_path: "model-2000"
/// all_model_checkpoint_paths: "model-1000"
/// all_model_checkpoint_paths: "model-2000"
/// ```
///
/// Other keys (timestamps and the like) are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointState {
	pub latest: Option<String>,
	pub all: Vec<String>,
}

impl CheckpointState {
	pub fn parse(text: &str) -> ReflectResult<Self> {
		let mut state = Self::default();

		for (number, line) in text.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			let (key, value) = line.split_once(':').ok_or_else(|| {
				ReflectError::ConfigError(format!(
					"Malformed checkpoint state at line {}: {}",
					number + 1,
					line
				))
			})?;
			let value = value.trim();

			match key.trim() {
				LATEST_KEY => state.latest = Some(unquote(value, number)?),
				ALL_KEY => state.all.push(unquote(value, number)?),
				_ => {}
			}
		}

		Ok(state)
	}

	pub fn render(&self) -> String {
		let mut text = String::new();
		if let Some(latest) = &self.latest {
			text.push_str(&format!("{}: \"{}\"\n", LATEST_KEY, latest));
		}
		for name in &self.all {
			text.push_str(&format!("{}: \"{}\"\n", ALL_KEY, name));
		}
		text
	}
}

fn unquote(value: &str, line: usize) -> ReflectResult<String> {
	value
		.strip_prefix('"')
		.and_then(|v| v.strip_suffix('"'))
		.map(str::to_string)
		.ok_or_else(|| {
			ReflectError::ConfigError(format!(
				"Unquoted checkpoint path at line {}: {}",
				line + 1,
				value
			))
		})
}

/// Snapshots of one model, stored under `<root>/<model>/`.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
	dir: PathBuf,
}

impl CheckpointStore {
	pub fn new(root: impl AsRef<Path>, model: &str) -> Self {
		Self {
			dir: root.as_ref().join(model),
		}
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn state_path(&self) -> PathBuf {
		self.dir.join(STATE_FILE)
	}

	/// Resolve a snapshot name from the state file to its payload file.
	/// Relative names live in the model directory.
	pub fn snapshot_path(&self, name: &str) -> PathBuf {
		let path = PathBuf::from(name);
		let path = if path.is_absolute() { path } else { self.dir.join(path) };

		if path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_EXTENSION) {
			return path;
		}
		// Names like `model.ckpt-1000` carry dots, so append rather than set.
		let mut raw: OsString = path.into_os_string();
		raw.push(".");
		raw.push(SNAPSHOT_EXTENSION);
		PathBuf::from(raw)
	}

	pub fn read_state(&self) -> ReflectResult<Option<CheckpointState>> {
		let path = self.state_path();
		if !path.is_file() {
			return Ok(None);
		}
		let text = std::fs::read_to_string(&path)
			.map_err(|e| ReflectError::IoError(format!("Failed to read {:?}: {}", path, e)))?;
		CheckpointState::parse(&text).map(Some)
	}

	/// Payload of the snapshot the state file marks as latest, if it exists.
	pub fn latest(&self) -> Option<PathBuf> {
		let state = match self.read_state() {
			Ok(Some(state)) => state,
			Ok(None) => return None,
			Err(e) => {
				tracing::warn!("Ignoring unreadable checkpoint state: {}", e);
				return None;
			}
		};

		let path = self.snapshot_path(state.latest.as_deref()?);
		if path.is_file() {
			Some(path)
		} else {
			tracing::warn!("Checkpoint state points at missing snapshot {:?}", path);
			None
		}
	}

	/// Write `model-<step>.safetensors` and make it the latest snapshot.
	pub fn save_snapshot(&self, params: &VarMap, step: u64) -> ReflectResult<PathBuf> {
		std::fs::create_dir_all(&self.dir)?;

		let name = format!("model-{}", step);
		let path = self.snapshot_path(&name);
		params
			.save(&path)
			.map_err(|e| ReflectError::ModelError(format!("Failed to write snapshot {:?}: {}", path, e)))?;

		let mut state = self.read_state()?.unwrap_or_default();
		state.all.retain(|existing| existing != &name);
		state.all.push(name.clone());
		while state.all.len() > MAX_TO_KEEP {
			let dropped = self.snapshot_path(&state.all.remove(0));
			if let Err(e) = std::fs::remove_file(&dropped) {
				tracing::warn!("Failed to remove old snapshot {:?}: {}", dropped, e);
			}
		}
		state.latest = Some(name);
		std::fs::write(self.state_path(), state.render())?;

		tracing::debug!("Saved snapshot {:?}", path);
		Ok(path)
	}
}

/// Copy every parameter of `params` from the snapshot at `path`, matched by
/// name. Missing or mis-shaped parameters are errors; extra tensors in the
/// snapshot are ignored.
pub fn restore(params: &VarMap, path: &Path) -> ReflectResult<()> {
	let vars = params
		.data()
		.lock()
		.map_err(|_| ReflectError::ModelError("Parameter store is poisoned".to_string()))?;
	let device = vars
		.values()
		.next()
		.map(|var| var.device().clone())
		.unwrap_or(Device::Cpu);

	let tensors = candle_core::safetensors::load(path, &device)
		.map_err(|e| ReflectError::ModelError(format!("Failed to read snapshot {:?}: {}", path, e)))?;

	let mut names: Vec<&String> = vars.keys().collect();
	names.sort();
	for name in names {
		let var = &vars[name];
		let tensor = tensors.get(name.as_str()).ok_or_else(|| {
			ReflectError::ModelError(format!("Snapshot {:?} is missing parameter {}", path, name))
		})?;
		if tensor.dims() != var.dims() {
			return Err(ReflectError::ModelError(format!(
				"Parameter {} has shape {:?} in snapshot, expected {:?}",
				name,
				tensor.dims(),
				var.dims()
			)));
		}
		var.set(&tensor.to_dtype(DType::F32)?)?;
	}

	let surplus = tensors.keys().filter(|name| !vars.contains_key(*name)).count();
	if surplus > 0 {
		tracing::warn!("Snapshot {:?} has {} unused tensors", path, surplus);
	}

	Ok(())
}

/// Restore the latest snapshot if there is one; otherwise keep the current
/// (seeded) parameters.
pub fn load_or_init(store: &CheckpointStore, params: &VarMap) -> ReflectResult<CheckpointStatus> {
	match store.latest() {
		Some(path) => {
			tracing::info!("loaded {}", path.display());
			restore(params, &path)?;
			Ok(CheckpointStatus::Loaded(path))
		}
		None => {
			tracing::info!("no checkpoint found in {}", store.dir().display());
			Ok(CheckpointStatus::NotFound)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::Tensor;
	use candle_nn::{Init, VarBuilder};
	use std::io::Write;
	use std::sync::{Arc, Mutex};

	#[derive(Clone, Default)]
	struct CapturedLog(Arc<Mutex<Vec<u8>>>);

	impl Write for CapturedLog {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.0.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	impl CapturedLog {
		fn text(&self) -> String {
			String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
		}
	}

	fn params_with(value: f32) -> VarMap {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		vb.pp("reflection").get_with_hints((2, 3), "weight", Init::Const(value as f64)).unwrap();
		vb.pp("transmission").get_with_hints(4, "bias", Init::Const(value as f64)).unwrap();
		varmap
	}

	fn value_of(params: &VarMap, name: &str) -> f32 {
		let data = params.data().lock().unwrap();
		data[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
	}

	#[test]
	fn test_parse_state() {
		let state = CheckpointState::parse(
			"model_checkpoint_path: \"model-2000\"\n\
			 all_model_checkpoint_paths: \"model-1000\"\n\
			 all_model_checkpoint_paths: \"model-2000\"\n\
			 last_preserved_timestamp: 1600000000.5\n",
		)
		.unwrap();
		assert_eq!(state.latest.as_deref(), Some("model-2000"));
		assert_eq!(state.all, vec!["model-1000", "model-2000"]);
		assert_eq!(CheckpointState::parse(&state.render()).unwrap(), state);
	}

	#[test]
	fn test_parse_rejects_garbage() {
		assert!(CheckpointState::parse("model_checkpoint_path model-1").is_err());
		assert!(CheckpointState::parse("model_checkpoint_path: model-1").is_err());
	}

	#[test]
	fn test_snapshot_path_appends_extension() {
		let store = CheckpointStore::new("ckpt", "full_global_lp");
		assert_eq!(
			store.snapshot_path("model.ckpt-1000"),
			PathBuf::from("ckpt/full_global_lp/model.ckpt-1000.safetensors")
		);
		assert_eq!(
			store.snapshot_path("model-5.safetensors"),
			PathBuf::from("ckpt/full_global_lp/model-5.safetensors")
		);
	}

	#[test]
	fn test_no_checkpoint_directory() {
		let root = tempfile::tempdir().unwrap();
		let store = CheckpointStore::new(root.path(), "missing_model");
		let params = params_with(0.5);

		assert_eq!(store.latest(), None);
		assert_eq!(load_or_init(&store, &params).unwrap(), CheckpointStatus::NotFound);
		assert_eq!(value_of(&params, "reflection.weight"), 0.5);
	}

	#[test]
	fn test_missing_checkpoint_is_logged() {
		let root = tempfile::tempdir().unwrap();
		let store = CheckpointStore::new(root.path(), "missing_model");
		let log = CapturedLog::default();
		let writer = log.clone();
		let subscriber = tracing_subscriber::fmt()
			.with_writer(move || writer.clone())
			.with_ansi(false)
			.finish();

		let status = tracing::subscriber::with_default(subscriber, || {
			load_or_init(&store, &params_with(0.5)).unwrap()
		});

		assert_eq!(status, CheckpointStatus::NotFound);
		assert!(log.text().contains("no checkpoint found"), "{}", log.text());
	}

	#[test]
	fn test_state_file_decides_latest() {
		let root = tempfile::tempdir().unwrap();
		let store = CheckpointStore::new(root.path(), "model");

		store.save_snapshot(&params_with(9.0), 900).unwrap();
		store.save_snapshot(&params_with(2.0), 2000).unwrap();

		// model-900.safetensors is the lexicographically last payload.
		let mut payloads: Vec<_> = std::fs::read_dir(store.dir())
			.unwrap()
			.map(|e| e.unwrap().file_name().into_string().unwrap())
			.filter(|name| name.ends_with(SNAPSHOT_EXTENSION))
			.collect();
		payloads.sort();
		assert_eq!(payloads.last().map(String::as_str), Some("model-900.safetensors"));

		let params = params_with(0.0);
		let status = load_or_init(&store, &params).unwrap();
		assert_eq!(status, CheckpointStatus::Loaded(store.snapshot_path("model-2000")));
		assert_eq!(value_of(&params, "reflection.weight"), 2.0);
		assert_eq!(value_of(&params, "transmission.bias"), 2.0);
	}

	#[test]
	fn test_save_marks_newest_as_latest() {
		let root = tempfile::tempdir().unwrap();
		let store = CheckpointStore::new(root.path(), "model");
		store.save_snapshot(&params_with(1.0), 1).unwrap();
		let path = store.save_snapshot(&params_with(3.0), 3).unwrap();

		assert_eq!(store.latest(), Some(path));
		let state = store.read_state().unwrap().unwrap();
		assert_eq!(state.all, vec!["model-1", "model-3"]);
	}

	#[test]
	fn test_save_prunes_oldest_snapshots() {
		let root = tempfile::tempdir().unwrap();
		let store = CheckpointStore::new(root.path(), "model");
		let params = params_with(1.0);
		for step in 0..(MAX_TO_KEEP as u64 + 5) {
			store.save_snapshot(&params, step).unwrap();
		}

		let state = store.read_state().unwrap().unwrap();
		assert_eq!(state.all.len(), MAX_TO_KEEP);
		assert_eq!(state.all.first().map(String::as_str), Some("model-5"));
		assert_eq!(state.latest.as_deref(), Some("model-24"));
		assert!(!store.snapshot_path("model-4").exists());
		assert!(store.snapshot_path("model-5").exists());

		let payloads = std::fs::read_dir(store.dir())
			.unwrap()
			.filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == SNAPSHOT_EXTENSION))
			.count();
		assert_eq!(payloads, MAX_TO_KEEP);
	}

	#[test]
	fn test_missing_payload_is_not_found() {
		let root = tempfile::tempdir().unwrap();
		let store = CheckpointStore::new(root.path(), "model");
		std::fs::create_dir_all(store.dir()).unwrap();
		std::fs::write(store.state_path(), "model_checkpoint_path: \"model-1\"\n").unwrap();
		assert_eq!(store.latest(), None);
	}

	#[test]
	fn test_restore_rejects_shape_mismatch() {
		let root = tempfile::tempdir().unwrap();
		let store = CheckpointStore::new(root.path(), "model");
		let path = store.save_snapshot(&params_with(1.0), 1).unwrap();

		let other = VarMap::new();
		let vb = VarBuilder::from_varmap(&other, DType::F32, &Device::Cpu);
		vb.pp("reflection").get_with_hints((3, 2), "weight", Init::Const(0.0)).unwrap();
		vb.pp("transmission").get_with_hints(4, "bias", Init::Const(0.0)).unwrap();

		assert!(matches!(restore(&other, &path), Err(ReflectError::ModelError(_))));
	}

	#[test]
	fn test_restore_rejects_missing_parameter() {
		let root = tempfile::tempdir().unwrap();
		let path = root.path().join("partial.safetensors");
		let tensors = std::collections::HashMap::from([(
			"reflection.weight".to_string(),
			Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
		)]);
		candle_core::safetensors::save(&tensors, &path).unwrap();

		assert!(matches!(restore(&params_with(1.0), &path), Err(ReflectError::ModelError(_))));
	}
}
