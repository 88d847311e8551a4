use crate::error::{ReflectError, ReflectResult};
use crate::image_loader::ImageTensor;
use image::{DynamicImage, GrayImage, RgbImage};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Images written per sample. The numeric prefixes order the files of one
/// sample in a directory listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
	InputAmbient,
	PredTransmission,
	PredReflection,
	InputFlash,
	InputPureflash,
	ShadowMask,
}

impl OutputKind {
	pub fn suffix(&self) -> &'static str {
		match self {
			OutputKind::InputAmbient => "_0_input_ambient.png",
			OutputKind::PredTransmission => "_1_pred_transmission.png",
			OutputKind::PredReflection => "_2_pred_reflection.png",
			OutputKind::InputFlash => "_3_input_flash.png",
			OutputKind::InputPureflash => "_4_input_pureflash.png",
			OutputKind::ShadowMask => "_5_shadow_mask.png",
		}
	}
}

/// Clip to [0, 1] and scale to 8 bits, truncating like a `uint8` cast.
#[inline]
pub fn quantize(value: f32) -> u8 {
	(value.clamp(0.0, 1.0) * 255.0) as u8
}

/// Build an 8-bit image from the first batch entry of a 1- or 3-channel tensor.
pub fn tensor_to_image(tensor: &ImageTensor) -> ReflectResult<DynamicImage> {
	let (_, h, w, c) = tensor.dim();
	let (width, height) = (w as u32, h as u32);

	match c {
		3 => Ok(DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
			let (x, y) = (x as usize, y as usize);
			image::Rgb([
				quantize(tensor[[0, y, x, 0]]),
				quantize(tensor[[0, y, x, 1]]),
				quantize(tensor[[0, y, x, 2]]),
			])
		}))),
		1 => Ok(DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
			image::Luma([quantize(tensor[[0, y as usize, x as usize, 0]])])
		}))),
		_ => Err(ReflectError::ImageError(format!(
			"Cannot save a {}-channel tensor as an image",
			c
		))),
	}
}

pub fn save_png(tensor: &ImageTensor, path: &Path) -> ReflectResult<()> {
	let image = tensor_to_image(tensor)?;
	image
		.save_with_format(path, image::ImageFormat::Png)
		.map_err(|e| ReflectError::ImageError(format!("Failed to save PNG {:?}: {}", path, e)))
}

/// Encode all images of one sample in parallel. Returns the written paths in
/// the order given.
pub fn write_outputs(outputs: &[(PathBuf, &ImageTensor)]) -> ReflectResult<Vec<PathBuf>> {
	if let Some(parent) = outputs.first().and_then(|(path, _)| path.parent()) {
		std::fs::create_dir_all(parent).map_err(|e| {
			ReflectError::IoError(format!("Failed to create output directory: {}", e))
		})?;
	}

	outputs
		.par_iter()
		.map(|(path, tensor)| save_png(tensor, path).map(|_| path.clone()))
		.collect()
}
