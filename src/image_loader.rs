use crate::dataset::SampleTriplet;
use crate::error::{ReflectError, ReflectResult};
use image::DynamicImage;
use ndarray::{s, Array4};
use std::path::Path;

/// `[1, H, W, C]` float image, values in [0, 1] after loading.
pub type ImageTensor = Array4<f32>;

/// Network inputs must have height and width divisible by this.
pub const CROP_MULTIPLE: usize = 32;

/// The three normalized, cropped inputs of one sample.
#[derive(Clone, Debug)]
pub struct TripletTensors {
	pub ambient: ImageTensor,
	pub flash: ImageTensor,
	pub pureflash: ImageTensor,
}

impl TripletTensors {
	/// Crop all three images to the largest multiple-of-32 shape that fits the
	/// ambient image.
	pub fn new(ambient: ImageTensor, flash: ImageTensor, pureflash: ImageTensor) -> ReflectResult<Self> {
		let (_, h, w, _) = ambient.dim();
		let (h, w) = crop_shape(h, w, CROP_MULTIPLE);
		if h == 0 || w == 0 {
			return Err(ReflectError::ImageError(format!(
				"Image of {}x{} is smaller than {}x{}",
				ambient.dim().2,
				ambient.dim().1,
				CROP_MULTIPLE,
				CROP_MULTIPLE
			)));
		}

		Ok(Self {
			ambient: crop(&ambient, h, w)?,
			flash: crop(&flash, h, w)?,
			pureflash: crop(&pureflash, h, w)?,
		})
	}

	pub fn height(&self) -> usize {
		self.ambient.dim().1
	}

	pub fn width(&self) -> usize {
		self.ambient.dim().2
	}
}

pub fn load_triplet(triplet: &SampleTriplet) -> ReflectResult<TripletTensors> {
	let pureflash = load_image(&triplet.pureflash)?;
	let ambient = load_image(&triplet.ambient)?;
	let flash = load_image(&triplet.flash)?;
	TripletTensors::new(ambient, flash, pureflash)
}

pub fn load_image(path: impl AsRef<Path>) -> ReflectResult<ImageTensor> {
	let path = path.as_ref();

	if !path.exists() {
		return Err(ReflectError::ImageError(format!(
			"Image file not found: {:?}",
			path
		)));
	}

	let extension = path
		.extension()
		.and_then(|ext| ext.to_str())
		.map(|s| s.to_lowercase())
		.ok_or_else(|| ReflectError::ImageError(format!("File has no extension: {:?}", path)))?;

	match extension.as_str() {
		"jpg" | "jpeg" | "png" => {
			let img = image::open(path).map_err(|e| {
				ReflectError::ImageError(format!("Failed to load image {:?}: {}", path, e))
			})?;
			Ok(image_to_tensor(&img))
		}
		_ => Err(ReflectError::ImageError(format!(
			"Unsupported image format: .{}",
			extension
		))),
	}
}

/// Convert to RGB and scale 8-bit values into [0, 1].
pub fn image_to_tensor(img: &DynamicImage) -> ImageTensor {
	let rgb = img.to_rgb8();
	let (width, height) = (rgb.width() as usize, rgb.height() as usize);

	Array4::from_shape_fn((1, height, width, 3), |(_, y, x, c)| {
		f32::from(rgb.get_pixel(x as u32, y as u32)[c]) / 255.0
	})
}

/// Largest `(height, width)` not exceeding the input that is divisible by `size`.
pub fn crop_shape(height: usize, width: usize, size: usize) -> (usize, usize) {
	(height / size * size, width / size * size)
}

/// Keep the top-left `height x width` window.
pub fn crop(tensor: &ImageTensor, height: usize, width: usize) -> ReflectResult<ImageTensor> {
	let (_, h, w, _) = tensor.dim();
	if h < height || w < width {
		return Err(ReflectError::ImageError(format!(
			"Cannot crop {}x{} image to {}x{}",
			w, h, width, height
		)));
	}
	Ok(tensor.slice(s![.., ..height, ..width, ..]).to_owned())
}

pub fn crop_to_multiple(tensor: &ImageTensor, size: usize) -> ReflectResult<ImageTensor> {
	let (_, h, w, _) = tensor.dim();
	let (h, w) = crop_shape(h, w, size);
	crop(tensor, h, w)
}
