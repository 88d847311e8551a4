use crate::config::NetworkConfig;
use crate::error::{ReflectError, ReflectResult};
use crate::image_loader::{ImageTensor, TripletTensors};
use crate::mask;
use crate::network::UNetSe;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Parameter prefix of the stage predicting the reflection layer.
pub const REFLECTION_STAGE: &str = "reflection";
/// Parameter prefix of the stage predicting the transmission layer.
pub const TRANSMISSION_STAGE: &str = "transmission";

// ambient (3) + gray pure-flash (1) + inverted shadow mask (1)
const REFLECTION_INPUTS: usize = 5;
// ambient (3) + predicted reflection (3) + inverted shadow mask (1)
const TRANSMISSION_INPUTS: usize = 7;
const RGB: usize = 3;

/// Everything the forward pass produces for one sample, `[1, H, W, C]` each.
#[derive(Clone, Debug)]
pub struct Prediction {
	/// Unclamped 3-channel transmission layer.
	pub transmission: ImageTensor,
	/// Unclamped 3-channel reflection layer.
	pub reflection: ImageTensor,
	/// Detected flash shadow, 1 channel, binary.
	pub shadow_mask: ImageTensor,
	/// Valid, non-saturated pure-flash signal, 3 channels, binary.
	pub valid_flash: ImageTensor,
}

/// Two chained U-Net-SE stages: the first estimates the reflection layer, the
/// second the transmission layer given that estimate.
pub struct FlashReflectionRemover {
	reflection_net: UNetSe,
	transmission_net: UNetSe,
	params: VarMap,
	device: Device,
}

impl FlashReflectionRemover {
	/// Build both stages with parameters drawn from a generator seeded by
	/// `seed`, so an unrestored model is still reproducible.
	pub fn new(config: NetworkConfig, device: &Device, seed: u64) -> ReflectResult<Self> {
		config.validate()?;

		let params = VarMap::new();
		let vb = VarBuilder::from_varmap(&params, DType::F32, device);
		let reflection_net = UNetSe::new(REFLECTION_INPUTS, RGB, &config, vb.pp(REFLECTION_STAGE))
			.map_err(|e| ReflectError::ModelError(format!("Failed to build reflection stage: {}", e)))?;
		let transmission_net =
			UNetSe::new(TRANSMISSION_INPUTS, RGB, &config, vb.pp(TRANSMISSION_STAGE)).map_err(|e| {
				ReflectError::ModelError(format!("Failed to build transmission stage: {}", e))
			})?;

		seed_parameters(&params, seed)?;

		Ok(Self {
			reflection_net,
			transmission_net,
			params,
			device: device.clone(),
		})
	}

	pub fn params(&self) -> &VarMap {
		&self.params
	}

	pub fn forward(&self, inputs: &TripletTensors) -> ReflectResult<Prediction> {
		let shadow_mask = mask::detect_shadow(inputs.ambient.view(), inputs.pureflash.view());
		let valid_flash = mask::valid_flash_mask(inputs.pureflash.view(), inputs.flash.view());
		let gray = mask::gray_pureflash(inputs.pureflash.view());
		let keep = mask::invert(&shadow_mask);

		let ambient = to_nchw(&inputs.ambient, &self.device)?;
		let gray = to_nchw(&gray, &self.device)?;
		let keep = to_nchw(&keep, &self.device)?;

		let reflection = self
			.reflection_net
			.forward(&Tensor::cat(&[&ambient, &gray, &keep], 1)?)
			.map_err(|e| ReflectError::ModelError(format!("Reflection stage failed: {}", e)))?;
		let transmission = self
			.transmission_net
			.forward(&Tensor::cat(&[&ambient, &reflection, &keep], 1)?)
			.map_err(|e| ReflectError::ModelError(format!("Transmission stage failed: {}", e)))?;

		Ok(Prediction {
			transmission: to_nhwc(&transmission)?,
			reflection: to_nhwc(&reflection)?,
			shadow_mask,
			valid_flash,
		})
	}
}

/// He-uniform weights and zero biases, visited in name order.
fn seed_parameters(params: &VarMap, seed: u64) -> ReflectResult<()> {
	let mut rng = StdRng::seed_from_u64(seed);
	let vars = params
		.data()
		.lock()
		.map_err(|_| ReflectError::ModelError("Parameter store is poisoned".to_string()))?;

	let mut names: Vec<&String> = vars.keys().collect();
	names.sort();

	for name in names {
		let var = &vars[name];
		let shape = var.shape().clone();
		let count = shape.elem_count();
		let values: Vec<f32> = match shape.dims() {
			[out, ..] if shape.rank() > 1 => {
				let fan_in = (count / (*out).max(1)).max(1);
				let bound = (6.0 / fan_in as f32).sqrt();
				(0..count).map(|_| rng.gen_range(-bound..bound)).collect()
			}
			_ => vec![0.0; count],
		};
		var.set(&Tensor::from_vec(values, shape, var.device())?)?;
	}

	Ok(())
}

fn to_nchw(tensor: &ImageTensor, device: &Device) -> ReflectResult<Tensor> {
	let (n, h, w, c) = tensor.dim();
	let data: Vec<f32> = tensor.iter().copied().collect();
	Ok(Tensor::from_vec(data, (n, h, w, c), device)?
		.permute((0, 3, 1, 2))?
		.contiguous()?)
}

fn to_nhwc(tensor: &Tensor) -> ReflectResult<ImageTensor> {
	let tensor = tensor
		.permute((0, 2, 3, 1))?
		.contiguous()?
		.to_device(&Device::Cpu)?;
	let (n, h, w, c) = tensor.dims4()?;
	let data = tensor.flatten_all()?.to_vec1::<f32>()?;
	Ok(Array4::from_shape_vec((n, h, w, c), data)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tiny_config() -> NetworkConfig {
		NetworkConfig {
			base_channels: 2,
			se_reduction: 2,
			..Default::default()
		}
	}

	fn gray_triplet(h: usize, w: usize) -> TripletTensors {
		let img = Array4::from_elem((1, h, w, 3), 0.5f32);
		TripletTensors::new(img.clone(), img.clone(), img).unwrap()
	}

	#[test]
	fn test_layout_roundtrip() {
		let tensor = Array4::from_shape_fn((1, 2, 3, 3), |(_, y, x, c)| (y * 9 + x * 3 + c) as f32);
		let nchw = to_nchw(&tensor, &Device::Cpu).unwrap();
		assert_eq!(nchw.dims4().unwrap(), (1, 3, 2, 3));
		assert_eq!(to_nhwc(&nchw).unwrap(), tensor);
	}

	#[test]
	fn test_forward_shapes() {
		let remover = FlashReflectionRemover::new(tiny_config(), &Device::Cpu, 2019).unwrap();
		let prediction = remover.forward(&gray_triplet(32, 64)).unwrap();

		assert_eq!(prediction.transmission.dim(), (1, 32, 64, 3));
		assert_eq!(prediction.reflection.dim(), (1, 32, 64, 3));
		assert_eq!(prediction.shadow_mask.dim(), (1, 32, 64, 1));
		assert_eq!(prediction.valid_flash.dim(), (1, 32, 64, 3));
		assert!(prediction.transmission.iter().all(|v| v.is_finite()));
	}

	#[test]
	fn test_same_seed_same_output() {
		let inputs = gray_triplet(32, 32);
		let a = FlashReflectionRemover::new(tiny_config(), &Device::Cpu, 7).unwrap();
		let b = FlashReflectionRemover::new(tiny_config(), &Device::Cpu, 7).unwrap();
		let c = FlashReflectionRemover::new(tiny_config(), &Device::Cpu, 8).unwrap();

		let out_a = a.forward(&inputs).unwrap().transmission;
		assert_eq!(out_a, b.forward(&inputs).unwrap().transmission);
		assert_ne!(out_a, c.forward(&inputs).unwrap().transmission);
	}

	#[test]
	fn test_stages_do_not_share_parameters() {
		let remover = FlashReflectionRemover::new(tiny_config(), &Device::Cpu, 1).unwrap();
		let data = remover.params().data().lock().unwrap();
		assert!(data.contains_key("reflection.enc1.conv1.weight"));
		assert!(data.contains_key("transmission.enc1.conv1.weight"));
		assert_eq!(data["reflection.enc1.conv1.weight"].dims(), &[2, 5, 3, 3]);
		assert_eq!(data["transmission.enc1.conv1.weight"].dims(), &[2, 7, 3, 3]);
	}
}
