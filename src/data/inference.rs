use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use image::RgbImage;
use image::imageops::FilterType;
use tracing::info;

use crate::data::DatasetError;
use crate::data::kitti::{ROAD_CLASS, image_tensor, load_resized, png_files};
use crate::ir::{Tensor, ValueId};
use crate::session::Session;

/// Road probability above which a pixel is painted.
pub const ROAD_THRESHOLD: f32 = 0.5;
/// Opacity of the green overlay, out of 255.
pub const OVERLAY_ALPHA: u8 = 127;

const OVERLAY_COLOR: [u8; 3] = [0, 255, 0];

/// Handles needed to run the trained network on one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceTensors {
    /// Flattened `[H * W, num_classes]` logits.
    pub logits: ValueId,
    pub keep_prob: ValueId,
    pub input_image: ValueId,
}

/// Runs the network on every `data_road/testing/image_2/*.png` under
/// `data_dir` and writes road overlays to `runs_dir/<unix-timestamp>/`.
/// Returns the output directory.
pub fn save_inference_samples(
    runs_dir: &Path,
    data_dir: &Path,
    session: &Session,
    image_shape: (usize, usize),
    tensors: &InferenceTensors,
) -> Result<PathBuf, DatasetError> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let output_dir = runs_dir.join(timestamp.to_string());
    std::fs::create_dir_all(&output_dir).map_err(|source| DatasetError::Io {
        path: output_dir.clone(),
        source,
    })?;
    info!(dir = %output_dir.display(), "saving test images");

    let test_dir = data_dir.join("data_road").join("testing").join("image_2");
    let mut written = 0_usize;
    for path in png_files(&test_dir)? {
        let image = load_resized(&path, image_shape, FilterType::Triangle)?;
        let road = road_probability(session, tensors, &image)?;
        let overlay = overlay(&image, &road);
        let Some(file_name) = path.file_name() else {
            continue;
        };
        let target = output_dir.join(file_name);
        overlay.save(&target).map_err(|source| DatasetError::Image {
            path: target.clone(),
            source,
        })?;
        written += 1;
    }
    info!(images = written, "saved inference samples");
    Ok(output_dir)
}

/// Per-pixel road probability in row-major order.
fn road_probability(
    session: &Session,
    tensors: &InferenceTensors,
    image: &RgbImage,
) -> Result<Vec<f32>, DatasetError> {
    let pixels = image_tensor(image)?;
    let mut shape = vec![1];
    shape.extend_from_slice(&pixels.shape);
    let batch = Tensor::new(shape, pixels.data)?;

    let fetched = session
        .run(
            &[tensors.logits],
            vec![
                (tensors.input_image, batch),
                (tensors.keep_prob, Tensor::scalar(1.0)),
            ],
        )
        .map_err(|err| DatasetError::Inference(err.to_string()))?;
    let Some(logits) = fetched.first() else {
        return Err(DatasetError::Inference("no logits fetched".to_string()));
    };
    let probabilities = logits.softmax_rows()?;
    let classes = probabilities.shape.get(1).copied().unwrap_or(0);
    if classes <= ROAD_CLASS {
        return Err(DatasetError::Inference(format!(
            "logits have {classes} classes, the road class is {ROAD_CLASS}"
        )));
    }
    Ok(probabilities
        .data
        .chunks(classes)
        .map(|row| row[ROAD_CLASS])
        .collect())
}

fn overlay(image: &RgbImage, road: &[f32]) -> RgbImage {
    let mut out = image.clone();
    let alpha = u16::from(OVERLAY_ALPHA);
    for (pixel, probability) in out.pixels_mut().zip(road) {
        if *probability <= ROAD_THRESHOLD {
            continue;
        }
        for (channel, tint) in pixel.0.iter_mut().zip(OVERLAY_COLOR) {
            let blended = (u16::from(tint) * alpha + u16::from(*channel) * (255 - alpha)) / 255;
            *channel = blended as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn only_confident_road_pixels_are_tinted() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([100, 100, 100]));
        image.put_pixel(1, 0, Rgb([100, 100, 100]));
        let out = overlay(&image, &[0.9, 0.5]);
        assert_eq!(out.get_pixel(1, 0).0, [100, 100, 100]);
        let tinted = out.get_pixel(0, 0).0;
        assert!(tinted[1] > 100);
        assert!(tinted[0] < 100);
    }
}
