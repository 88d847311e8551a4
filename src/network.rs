//! U-Net with squeeze-excitation blocks, the building block of both stages.
//!
//! Tensors are NCHW. Parameters are requested from the `VarBuilder` under
//! `enc{1..5}`, `up{1..4}`, `dec{1..4}` and `head`, each conv block holding
//! `conv1`, `conv2` and `se.fc1`/`se.fc2`.

use crate::config::NetworkConfig;
use candle_core::{Module, Result, Tensor, D};
use candle_nn::{
	conv2d, conv_transpose2d, linear, Conv2d, Conv2dConfig, ConvTranspose2d,
	ConvTranspose2dConfig, Linear, VarBuilder,
};

const LEVELS: usize = 5;
const LEAKY_SLOPE: f64 = 0.2;

/// Height and width of the network input must be multiples of this.
pub const SPATIAL_DIVISOR: usize = 1 << (LEVELS - 1);

fn lrelu(xs: &Tensor) -> Result<Tensor> {
	xs.maximum(&(xs * LEAKY_SLOPE)?)
}

/// Channel attention: global average pool, bottleneck MLP, sigmoid gate.
struct SqueezeExcitation {
	fc1: Linear,
	fc2: Linear,
}

impl SqueezeExcitation {
	fn new(channels: usize, reduction: usize, vb: VarBuilder) -> Result<Self> {
		let hidden = (channels / reduction).max(1);
		Ok(Self {
			fc1: linear(channels, hidden, vb.pp("fc1"))?,
			fc2: linear(hidden, channels, vb.pp("fc2"))?,
		})
	}
}

impl Module for SqueezeExcitation {
	fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let (b, c, _, _) = xs.dims4()?;
		let pooled = xs.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?.reshape((b, c))?;
		let hidden = self.fc1.forward(&pooled)?.relu()?;
		let gate = candle_nn::ops::sigmoid(&self.fc2.forward(&hidden)?)?;
		xs.broadcast_mul(&gate.reshape((b, c, 1, 1))?)
	}
}

struct ConvBlock {
	conv1: Conv2d,
	conv2: Conv2d,
	se: SqueezeExcitation,
}

impl ConvBlock {
	fn new(in_channels: usize, out_channels: usize, reduction: usize, vb: VarBuilder) -> Result<Self> {
		let cfg = Conv2dConfig {
			padding: 1,
			..Default::default()
		};
		Ok(Self {
			conv1: conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv1"))?,
			conv2: conv2d(out_channels, out_channels, 3, cfg, vb.pp("conv2"))?,
			se: SqueezeExcitation::new(out_channels, reduction, vb.pp("se"))?,
		})
	}
}

impl Module for ConvBlock {
	fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let xs = lrelu(&self.conv1.forward(xs)?)?;
		let xs = lrelu(&self.conv2.forward(&xs)?)?;
		self.se.forward(&xs)
	}
}

pub struct UNetSe {
	encoders: Vec<ConvBlock>,
	upsamplers: Vec<ConvTranspose2d>,
	decoders: Vec<ConvBlock>,
	head: Conv2d,
	in_channels: usize,
}

impl UNetSe {
	pub fn new(
		in_channels: usize,
		out_channels: usize,
		config: &NetworkConfig,
		vb: VarBuilder,
	) -> Result<Self> {
		let widths: Vec<usize> = (0..LEVELS).map(|level| config.base_channels << level).collect();
		let reduction = config.se_reduction;

		let mut encoders = Vec::with_capacity(LEVELS);
		let mut prev = in_channels;
		for (level, &width) in widths.iter().enumerate() {
			encoders.push(ConvBlock::new(prev, width, reduction, vb.pp(format!("enc{}", level + 1)))?);
			prev = width;
		}

		let up_cfg = ConvTranspose2dConfig {
			stride: 2,
			..Default::default()
		};
		let mut upsamplers = Vec::with_capacity(LEVELS - 1);
		let mut decoders = Vec::with_capacity(LEVELS - 1);
		for level in (0..LEVELS - 1).rev() {
			let width = widths[level];
			upsamplers.push(conv_transpose2d(
				widths[level + 1],
				width,
				2,
				up_cfg,
				vb.pp(format!("up{}", level + 1)),
			)?);
			decoders.push(ConvBlock::new(width * 2, width, reduction, vb.pp(format!("dec{}", level + 1)))?);
		}

		let head = conv2d(widths[0], out_channels, 1, Default::default(), vb.pp("head"))?;

		Ok(Self {
			encoders,
			upsamplers,
			decoders,
			head,
			in_channels,
		})
	}
}

impl Module for UNetSe {
	fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let (_, c, h, w) = xs.dims4()?;
		if c != self.in_channels {
			candle_core::bail!("expected {} input channels, got {}", self.in_channels, c);
		}
		if h % SPATIAL_DIVISOR != 0 || w % SPATIAL_DIVISOR != 0 {
			candle_core::bail!("input {}x{} is not a multiple of {}", w, h, SPATIAL_DIVISOR);
		}

		let mut skips = Vec::with_capacity(LEVELS - 1);
		let mut xs = xs.clone();
		for (level, encoder) in self.encoders.iter().enumerate() {
			xs = encoder.forward(&xs)?;
			if level + 1 < LEVELS {
				skips.push(xs.clone());
				xs = xs.max_pool2d(2)?;
			}
		}

		for ((up, decoder), skip) in self
			.upsamplers
			.iter()
			.zip(&self.decoders)
			.zip(skips.iter().rev())
		{
			let upsampled = up.forward(&xs)?;
			xs = decoder.forward(&Tensor::cat(&[&upsampled, skip], 1)?)?;
		}

		self.head.forward(&xs)
	}
}
