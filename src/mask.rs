//! Hand-designed masks fed to the network alongside the images.
//!
//! All functions take `[1, H, W, C]` views and return freshly allocated
//! arrays; the inputs of one call must share batch, height and width.

use ndarray::{Array4, ArrayView4, Axis, Zip};

/// Flash/ambient brightness ratio below which a pixel is a shadow suspect.
pub const SHADOW_RATIO_THRESHOLD: f32 = 0.8;
/// Flash-only intensity below which a pixel counts as dark.
pub const DARK_THRESHOLD: f32 = 0.3;
const RATIO_EPSILON: f32 = 1e-5;

pub const PUREFLASH_FLOOR: f32 = 0.02;
pub const FLASH_CEILING: f32 = 0.96;

// The trained checkpoints saw 0.33 * (r + g + b), not an exact mean.
const GRAY_WEIGHT: f32 = 0.33;

/// Per-pixel L2 norm across channels, `[1, H, W, 1]`.
pub fn intensity(image: ArrayView4<f32>) -> Array4<f32> {
	image
		.map_axis(Axis(3), |pixel| pixel.iter().map(|v| v * v).sum::<f32>().sqrt())
		.insert_axis(Axis(3))
}

/// Flag pixels the flash failed to reach.
///
/// A pixel is flagged when its flash-only intensity is both dark in absolute
/// terms and disproportionately weak compared to the ambient image, each
/// image being measured relative to its own mean brightness.
///
/// When either image has no usable mean brightness (all black, or non-finite)
/// the ratios are undefined and the mask is all zeros.
///
/// # Panics
///
/// If `ambient` and `flash_only` differ in batch, height or width.
pub fn detect_shadow(ambient: ArrayView4<f32>, flash_only: ArrayView4<f32>) -> Array4<f32> {
	let ambient_intensity = intensity(ambient);
	let flash_intensity = intensity(flash_only);
	let mut mask = Array4::zeros(flash_intensity.raw_dim());

	let (Some(ambient_mean), Some(flash_mean)) =
		(usable_mean(&ambient_intensity), usable_mean(&flash_intensity))
	else {
		return mask;
	};

	Zip::from(&mut mask)
		.and(&ambient_intensity)
		.and(&flash_intensity)
		.for_each(|m, &a, &f| {
			let pf_div_by_ambient = (f / flash_mean) / (a / ambient_mean + RATIO_EPSILON);
			let shadow = pf_div_by_ambient < SHADOW_RATIO_THRESHOLD;
			let dark = f < DARK_THRESHOLD;
			*m = if shadow && dark { 1.0 } else { 0.0 };
		});

	mask
}

fn usable_mean(intensity: &Array4<f32>) -> Option<f32> {
	intensity.mean().filter(|m| m.is_finite() && *m > 0.0)
}

/// Per-channel mask of valid pure-flash signal: present in the pure-flash
/// image and not saturated in the flash image.
///
/// # Panics
///
/// If the two images differ in shape.
pub fn valid_flash_mask(pureflash: ArrayView4<f32>, flash: ArrayView4<f32>) -> Array4<f32> {
	Zip::from(&pureflash).and(&flash).map_collect(|&pf, &f| {
		if pf > PUREFLASH_FLOOR && f < FLASH_CEILING {
			1.0
		} else {
			0.0
		}
	})
}

/// Single-channel pure-flash map, `[1, H, W, 1]`.
pub fn gray_pureflash(pureflash: ArrayView4<f32>) -> Array4<f32> {
	pureflash
		.map_axis(Axis(3), |pixel| GRAY_WEIGHT * pixel.iter().take(3).sum::<f32>())
		.insert_axis(Axis(3))
}

pub fn invert(mask: &Array4<f32>) -> Array4<f32> {
	mask.mapv(|v| 1.0 - v)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn filled(h: usize, w: usize, c: usize, value: f32) -> Array4<f32> {
		Array4::from_elem((1, h, w, c), value)
	}

	#[test]
	fn test_all_zero_inputs_give_empty_mask() {
		let zeros = filled(8, 8, 3, 0.0);
		let mask = detect_shadow(zeros.view(), zeros.view());
		assert_eq!(mask.dim(), (1, 8, 8, 1));
		assert!(mask.iter().all(|&v| v == 0.0));
	}

	#[test]
	fn test_black_ambient_gives_empty_mask() {
		let ambient = filled(4, 4, 3, 0.0);
		let flash = filled(4, 4, 3, 0.1);
		let mask = detect_shadow(ambient.view(), flash.view());
		assert!(mask.iter().all(|&v| v == 0.0));
	}

	#[test]
	fn test_flags_flash_shadow() {
		let ambient = filled(4, 4, 3, 0.5);
		let mut flash = filled(4, 4, 3, 0.5);
		flash.slice_mut(ndarray::s![0, 1, 2, ..]).fill(0.05);

		let mask = detect_shadow(ambient.view(), flash.view());
		assert_eq!(mask[[0, 1, 2, 0]], 1.0);
		assert_eq!(mask.sum(), 1.0);
	}

	#[test]
	fn test_uniformly_dark_scene_is_not_shadow() {
		// Dark everywhere, but the flash/ambient ratio is the same as the mean.
		let ambient = filled(4, 4, 3, 0.05);
		let flash = filled(4, 4, 3, 0.05);
		let mask = detect_shadow(ambient.view(), flash.view());
		assert!(mask.iter().all(|&v| v == 0.0));
	}

	#[test]
	fn test_weak_but_bright_pixel_is_not_shadow() {
		// Relatively weak flash, yet above the absolute dark threshold.
		let ambient = filled(2, 2, 3, 0.5);
		let mut flash = filled(2, 2, 3, 0.9);
		flash.slice_mut(ndarray::s![0, 0, 0, ..]).fill(0.3);
		let mask = detect_shadow(ambient.view(), flash.view());
		assert_eq!(mask[[0, 0, 0, 0]], 0.0);
	}

	#[test]
	fn test_mask_is_binary() {
		let ambient = Array4::from_shape_fn((1, 6, 7, 3), |(_, y, x, c)| {
			((y * 7 + x + c) % 11) as f32 / 10.0
		});
		let flash = Array4::from_shape_fn((1, 6, 7, 3), |(_, y, x, c)| {
			((y * 3 + x * 5 + c) % 13) as f32 / 40.0
		});
		let mask = detect_shadow(ambient.view(), flash.view());
		assert!(mask.iter().all(|&v| v == 0.0 || v == 1.0));
	}

	#[test]
	fn test_valid_flash_thresholds() {
		let pureflash = Array4::from_shape_vec((1, 1, 4, 1), vec![0.01, 0.5, 0.5, 0.03]).unwrap();
		let flash = Array4::from_shape_vec((1, 1, 4, 1), vec![0.5, 0.97, 0.5, 0.95]).unwrap();
		let mask = valid_flash_mask(pureflash.view(), flash.view());
		assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 1.0, 1.0]);
	}

	#[test]
	fn test_gray_pureflash_and_invert() {
		let pureflash = Array4::from_shape_vec((1, 1, 1, 3), vec![0.3, 0.6, 0.9]).unwrap();
		let gray = gray_pureflash(pureflash.view());
		assert_eq!(gray.dim(), (1, 1, 1, 1));
		assert!((gray[[0, 0, 0, 0]] - 0.594).abs() < 1e-5);

		let mask = Array4::from_shape_vec((1, 1, 2, 1), vec![0.0, 1.0]).unwrap();
		assert_eq!(invert(&mask).iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0]);
	}
}
