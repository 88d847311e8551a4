use thiserror::Error;

pub type ReflectResult<T> = Result<T, ReflectError>;

#[derive(Debug, Error)]
pub enum ReflectError {
	#[error("Model error: {0}")]
	ModelError(String),
	#[error("Image error: {0}")]
	ImageError(String),
	#[error("Tensor error: {0}")]
	TensorError(String),
	#[error("I/O error: {0}")]
	IoError(String),
	#[error("Configuration error: {0}")]
	ConfigError(String),
	#[error("Device error: {0}")]
	DeviceError(String),
}

impl From<std::io::Error> for ReflectError {
	fn from(e: std::io::Error) -> Self {
		ReflectError::IoError(e.to_string())
	}
}

impl From<image::ImageError> for ReflectError {
	fn from(e: image::ImageError) -> Self {
		ReflectError::ImageError(e.to_string())
	}
}

impl From<candle_core::Error> for ReflectError {
	fn from(e: candle_core::Error) -> Self {
		ReflectError::TensorError(e.to_string())
	}
}

impl From<ndarray::ShapeError> for ReflectError {
	fn from(e: ndarray::ShapeError) -> Self {
		ReflectError::TensorError(e.to_string())
	}
}

impl From<serde_json::Error> for ReflectError {
	fn from(e: serde_json::Error) -> Self {
		ReflectError::ConfigError(e.to_string())
	}
}
