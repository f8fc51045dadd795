//! Data Augmentation Module
//!
//! Random geometric augmentation for the training generator: rotation,
//! width/height shift, shear, zoom and flips, combined into one affine
//! transform around the image centre. Pixels mapped outside the source are
//! filled from the nearest edge.
//!
//! Validation and evaluation generators never augment.

use image::{Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Augmentation ranges, read from `AUGMENTATION_PARAMS` in params.yaml
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Maximum rotation in degrees (uniform in ±rotation_range)
    pub rotation_range: f32,
    /// Maximum horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Maximum vertical shift as a fraction of the height
    pub height_shift_range: f32,
    /// Maximum shear angle in degrees
    pub shear_range: f32,
    /// Zoom factors are drawn from [1 - zoom_range, 1 + zoom_range] per axis
    pub zoom_range: f32,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 40.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
            vertical_flip: false,
        }
    }
}

impl AugmentationConfig {
    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
            vertical_flip: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        self == &Self::none()
    }
}

/// One concrete draw of transform parameters
#[derive(Clone, Debug, PartialEq)]
pub struct TransformParams {
    /// Rotation in degrees
    pub theta: f32,
    /// Horizontal shift in pixels
    pub tx: f32,
    /// Vertical shift in pixels
    pub ty: f32,
    /// Shear in degrees
    pub shear: f32,
    pub zx: f32,
    pub zy: f32,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl TransformParams {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            tx: 0.0,
            ty: 0.0,
            shear: 0.0,
            zx: 1.0,
            zy: 1.0,
            flip_horizontal: false,
            flip_vertical: false,
        }
    }

    fn is_affine_identity(&self) -> bool {
        self.theta == 0.0
            && self.tx == 0.0
            && self.ty == 0.0
            && self.shear == 0.0
            && self.zx == 1.0
            && self.zy == 1.0
    }
}

/// Image augmenter that applies random transformations
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Draw transform parameters for an image of the given size
    pub fn random_transform(&self, width: u32, height: u32, rng: &mut ChaCha8Rng) -> TransformParams {
        let c = &self.config;
        let symmetric = |rng: &mut ChaCha8Rng, range: f32| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };

        let theta = symmetric(rng, c.rotation_range);
        let tx = symmetric(rng, c.width_shift_range) * width as f32;
        let ty = symmetric(rng, c.height_shift_range) * height as f32;
        let shear = symmetric(rng, c.shear_range);
        let (zx, zy) = if c.zoom_range > 0.0 {
            let lo = (1.0 - c.zoom_range).max(f32::EPSILON);
            let hi = 1.0 + c.zoom_range;
            (rng.gen_range(lo..=hi), rng.gen_range(lo..=hi))
        } else {
            (1.0, 1.0)
        };
        let flip_horizontal = c.horizontal_flip && rng.gen::<f32>() < 0.5;
        let flip_vertical = c.vertical_flip && rng.gen::<f32>() < 0.5;

        TransformParams {
            theta,
            tx,
            ty,
            shear,
            zx,
            zy,
            flip_horizontal,
            flip_vertical,
        }
    }

    /// Apply a random transform; the output keeps the input dimensions
    pub fn augment(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        if self.config.is_identity() {
            return img.clone();
        }
        let params = self.random_transform(img.width(), img.height(), rng);
        apply_transform(img, &params)
    }
}

/// Apply the affine part, then flips.
///
/// Every output pixel is mapped back into the source with the inverse-style
/// matrix `rotation * shear * zoom` around the centre, plus the shift.
pub fn apply_transform(img: &RgbImage, params: &TransformParams) -> RgbImage {
    let mut output = if params.is_affine_identity() {
        img.clone()
    } else {
        let (width, height) = img.dimensions();
        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;

        let (sin_t, cos_t) = params.theta.to_radians().sin_cos();
        let (sin_s, cos_s) = params.shear.to_radians().sin_cos();

        // rotation [[cos, -sin], [sin, cos]] * shear [[1, -sin_s], [0, cos_s]]
        let rs = [
            [cos_t, -cos_t * sin_s - sin_t * cos_s],
            [sin_t, -sin_t * sin_s + cos_t * cos_s],
        ];
        // ... * zoom diag(zx, zy)
        let m = [
            [rs[0][0] * params.zx, rs[0][1] * params.zy],
            [rs[1][0] * params.zx, rs[1][1] * params.zy],
        ];

        let mut out = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                let src_x = m[0][0] * dx + m[0][1] * dy + cx + params.tx;
                let src_y = m[1][0] * dx + m[1][1] * dy + cy + params.ty;
                out.put_pixel(x, y, bilinear_sample(img, src_x, src_y));
            }
        }
        out
    };

    if params.flip_horizontal {
        image::imageops::flip_horizontal_in_place(&mut output);
    }
    if params.flip_vertical {
        image::imageops::flip_vertical_in_place(&mut output);
    }
    output
}

/// Bilinear interpolation; coordinates outside the image are clamped to the nearest edge
fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        result[c] = v.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}
