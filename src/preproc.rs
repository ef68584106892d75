//! Frame preprocessing.
//!
use image::RgbImage;
use tract_onnx::prelude::*;

/// Input geometry and normalization of the compiled model.
///
/// Passed explicitly wherever the input tensor layout matters instead of
/// living next to the model as ambient state.
#[derive(Clone, Debug)]
pub struct InputLayout {
    pub width: u32,
    pub height: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl InputLayout {
    /// Layout of the 320x240 Ultraface variant.
    pub fn ultraface_320() -> Self {
        Self {
            width: 320,
            height: 240,
            // Note: Mean/std are from MobileNet, not from Ultraface, but work well
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Turn a captured frame into the model's input tensor.
///
/// Resizes to the layout's spatial shape, reorders HWC to CHW, casts to f32
/// with per-channel mean/std normalization and adds a batch dimension of 1.
pub fn preprocess(frame: &RgbImage, layout: &InputLayout) -> Tensor {
    let resized: RgbImage = image::imageops::resize(
        frame,
        layout.width,
        layout.height,
        image::imageops::FilterType::Triangle,
    );

    tract_ndarray::Array4::from_shape_fn(
        (1, 3, layout.height as usize, layout.width as usize),
        |(_, c, y, x)| {
            (resized[(x as _, y as _)][c] as f32 / 255.0 - layout.mean[c]) / layout.std[c]
        },
    )
    .into()
}
