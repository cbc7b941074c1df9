/// Preprocessing of input images for the embedding model.
/// Do not use these functions for any other purpose (for example,
/// to produce images for display); the output is only meaningful as model input.

use std::path::PathBuf;

use image::{imageops::FilterType, DynamicImage};
use ndarray::Array4;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// Number of color channels the model consumes (RGB, alpha dropped).
pub const CHANNELS: usize = 3;

/// The fixed spatial resolution of the model input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize
{
	pub height: usize,
	pub width: usize,
}

impl InputSize
{
	pub fn new(height: usize, width: usize) -> Self
	{
		InputSize { height, width }
	}
}

impl From<&ModelConfig> for InputSize
{
	fn from(config: &ModelConfig) -> Self
	{
		InputSize::new(config.input_height, config.input_width)
	}
}

/// Decodes raw image bytes (any format the `image` crate recognizes) and converts
/// them into the model's input tensor of shape `[1, H, W, 3]` with values in `[0, 1]`.
///
/// The decoded and resized images are dropped before returning, on both the success
/// and the error path; only the tensor leaves this function.
pub fn preprocess(bytes: &[u8], size: InputSize) -> Result<Array4<f32>>
{
	let img = image::load_from_memory(bytes)?;
	Ok(image_to_model_format(&img, size))
}

/// Loads the images at the given paths in parallel.
/// Failures are reported per path so that one bad file doesn't sink the batch.
pub fn load_image_batch(paths: &[PathBuf]) -> Vec<(PathBuf, Result<DynamicImage>)>
{
	paths.par_iter().map(
		| path |
		{
			let img: Result<DynamicImage> = image::open(path).map_err(Error::from);
			(path.clone(), img)
		}
	).collect::<Vec<(PathBuf, Result<DynamicImage>)>>()
}

// Convert the image to the 4D NHWC array expected by the model.
// Aspect ratio is not preserved; the image is stretched to the target size.
pub fn image_to_model_format(img: &DynamicImage, size: InputSize) -> Array4<f32>
{
	let resized = img
		.resize_exact(size.width as u32, size.height as u32, FilterType::Triangle)
		.to_rgb8();

	let mut image_input = Array4::zeros((1, size.height, size.width, CHANNELS));
	for (x, y, pixel) in resized.enumerate_pixels()
	{
		let (x, y) = (x as usize, y as usize);
		let [r, g, b] = pixel.0;
		image_input[[0, y, x, 0]] = (r as f32) / 255.;
		image_input[[0, y, x, 1]] = (g as f32) / 255.;
		image_input[[0, y, x, 2]] = (b as f32) / 255.;
	}

	image_input
}
