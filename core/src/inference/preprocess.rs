//! Image decoding into planar, batched host input.
//!
//! Each image is resized to the plan's input size with bilinear filtering,
//! scaled to `[0, 1]`, and written channel-major into its own batch slot:
//!
//! ```text
//! offset(b, c) = b * C * H * W + c * H * W
//! ```

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use rayon::prelude::*;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ForgeError, Result};

/// Order in which color channels are written into the channel planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    /// Blue plane first.
    #[default]
    Bgr,
    Rgb,
}

impl ChannelOrder {
    /// RGB component written to plane `channel`.
    fn source_channel(self, channel: usize) -> usize {
        match self {
            Self::Rgb => channel,
            Self::Bgr => 2 - channel,
        }
    }
}

impl FromStr for ChannelOrder {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bgr" => Ok(Self::Bgr),
            "rgb" => Ok(Self::Rgb),
            other => Err(ForgeError::config(format!("Invalid channel order: {}", other))),
        }
    }
}

/// Float offset of plane `channel` of batch slot `batch_index`.
pub fn planar_offset(
    batch_index: usize,
    channel: usize,
    channels: usize,
    height: usize,
    width: usize,
) -> usize {
    batch_index * channels * height * width + channel * height * width
}

fn check_channels(channels: usize) -> Result<()> {
    if channels == 1 || channels == 3 {
        Ok(())
    } else {
        Err(ForgeError::binding_mismatch(format!(
            "input expects {} channels; images decode to 1 or 3",
            channels
        )))
    }
}

fn decode(path: &Path, height: usize, width: usize) -> Result<DynamicImage> {
    let image = image::open(path).map_err(|e| ForgeError::DecodeFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(image.resize_exact(width as u32, height as u32, FilterType::Triangle))
}

/// Write one resized image into `dst`, which holds exactly one batch slot.
fn write_planar(
    dst: &mut [f32],
    image: &DynamicImage,
    channels: usize,
    height: usize,
    width: usize,
    order: ChannelOrder,
) -> Result<()> {
    match channels {
        1 => {
            let luma = image.to_luma8();
            for (i, px) in luma.pixels().enumerate() {
                dst[i] = f32::from(px[0]) / 255.0;
            }
        }
        3 => {
            let rgb = image.to_rgb8();
            let planes: [(usize, usize); 3] = [0, 1, 2].map(|c| {
                (
                    planar_offset(0, c, channels, height, width),
                    order.source_channel(c),
                )
            });
            for (i, px) in rgb.pixels().enumerate() {
                for &(base, src) in &planes {
                    dst[base + i] = f32::from(px[src]) / 255.0;
                }
            }
        }
        n => return check_channels(n),
    }
    Ok(())
}

/// Decode `image_path` into batch slot `batch_index` of `host`.
///
/// Only the slot's own `channels * height * width` floats are written, so
/// calls for different batch indices may run in any order.
pub fn fill(
    host: &mut [f32],
    batch_index: usize,
    image_path: &Path,
    channels: usize,
    height: usize,
    width: usize,
    order: ChannelOrder,
) -> Result<()> {
    check_channels(channels)?;
    let start = planar_offset(batch_index, 0, channels, height, width);
    let end = planar_offset(batch_index + 1, 0, channels, height, width);
    if end > host.len() {
        return Err(ForgeError::binding_mismatch(format!(
            "batch slot {} ends at {} but the host buffer holds {} values",
            batch_index,
            end,
            host.len()
        )));
    }
    let image = decode(image_path, height, width)?;
    write_planar(&mut host[start..end], &image, channels, height, width, order)
}

/// Host-side `[N, C, H, W]` input batch.
#[derive(Debug, Clone)]
pub struct HostInputBatch {
    data: Array4<f32>,
    filled: Vec<bool>,
    order: ChannelOrder,
}

impl HostInputBatch {
    pub fn new(batch: usize, channels: usize, height: usize, width: usize) -> Result<Self> {
        if batch == 0 || height == 0 || width == 0 {
            return Err(ForgeError::binding_mismatch(format!(
                "input shape [{}, {}, {}, {}] has an empty axis",
                batch, channels, height, width
            )));
        }
        check_channels(channels)?;
        Ok(Self {
            data: Array4::zeros((batch, channels, height, width)),
            filled: vec![false; batch],
            order: ChannelOrder::default(),
        })
    }

    /// Batch for a resolved `[N, C, H, W]` input shape.
    pub fn from_shape(shape: &[usize]) -> Result<Self> {
        let &[batch, channels, height, width] = shape else {
            return Err(ForgeError::binding_mismatch(format!(
                "image input must be [N, C, H, W], plan declares {:?}",
                shape
            )));
        };
        Self::new(batch, channels, height, width)
    }

    pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
        self.order = order;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[3]
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Number of batch slots written so far.
    pub fn filled(&self) -> usize {
        self.filled.iter().filter(|&&f| f).count()
    }

    pub fn is_complete(&self) -> bool {
        self.filled.iter().all(|&f| f)
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn as_slice(&self) -> Result<&[f32]> {
        self.data
            .as_slice()
            .ok_or_else(|| ForgeError::execution("host batch is not contiguous"))
    }

    fn as_slice_mut(&mut self) -> Result<&mut [f32]> {
        self.data
            .as_slice_mut()
            .ok_or_else(|| ForgeError::execution("host batch is not contiguous"))
    }

    /// Decode one image into slot `batch_index`.
    pub fn fill(&mut self, batch_index: usize, image_path: impl AsRef<Path>) -> Result<()> {
        if batch_index >= self.batch_size() {
            return Err(ForgeError::binding_mismatch(format!(
                "batch index {} out of range for batch size {}",
                batch_index,
                self.batch_size()
            )));
        }
        let (channels, height, width, order) =
            (self.channels(), self.height(), self.width(), self.order);
        fill(
            self.as_slice_mut()?,
            batch_index,
            image_path.as_ref(),
            channels,
            height,
            width,
            order,
        )?;
        self.filled[batch_index] = true;
        Ok(())
    }

    /// Decode one image per batch slot, in slot order.
    ///
    /// With `parallel` set, images are decoded on the rayon pool; each worker
    /// writes only its own slot and the call returns after all have finished.
    ///
    /// # Errors
    ///
    /// [`ForgeError::IncompleteBatch`] if `paths` does not hold exactly one
    /// path per slot, and [`ForgeError::DecodeFailed`] for the first image
    /// that cannot be decoded.
    pub fn fill_all<P: AsRef<Path> + Sync>(&mut self, paths: &[P], parallel: bool) -> Result<()> {
        let expected = self.batch_size();
        if paths.len() != expected {
            return Err(ForgeError::IncompleteBatch {
                expected,
                got: paths.len(),
            });
        }

        let (channels, height, width, order) =
            (self.channels(), self.height(), self.width(), self.order);
        let image_len = channels * height * width;
        let host = self.as_slice_mut()?;

        let decode_into = |(slot, path): (&mut [f32], &P)| -> Result<()> {
            let image = decode(path.as_ref(), height, width)?;
            write_planar(slot, &image, channels, height, width, order)
        };
        if parallel {
            host.par_chunks_mut(image_len)
                .zip(paths.par_iter())
                .try_for_each(decode_into)?;
        } else {
            host.chunks_mut(image_len)
                .zip(paths.iter())
                .try_for_each(decode_into)?;
        }

        self.filled.iter_mut().for_each(|f| *f = true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;

    fn solid_png(dir: &Path, name: &str, rgb: [u8; 3]) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(5, 3, Rgb(rgb)).save(&path).unwrap();
        path
    }

    #[test]
    fn test_planar_offset_law() {
        assert_eq!(planar_offset(2, 1, 3, 640, 640), 1_638_400);
        assert_eq!(planar_offset(0, 0, 3, 640, 640), 0);
        assert_eq!(planar_offset(1, 0, 3, 2, 2), planar_offset(0, 2, 3, 2, 2) + 4);
    }

    #[test]
    fn test_fill_writes_only_its_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = solid_png(dir.path(), "red.png", [255, 0, 51]);

        let (channels, height, width) = (3, 4, 4);
        let mut host = vec![-1.0f32; 3 * channels * height * width];
        fill(&mut host, 1, &path, channels, height, width, ChannelOrder::Rgb).unwrap();

        let plane = height * width;
        let slot = planar_offset(1, 0, channels, height, width);
        assert!(host[..slot].iter().all(|&v| v == -1.0));
        assert!(host[slot + 3 * plane..].iter().all(|&v| v == -1.0));
        for &v in &host[slot..slot + plane] {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-6);
        }
        for &v in &host[slot + plane..slot + 2 * plane] {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-6);
        }
        for &v in &host[slot + 2 * plane..slot + 3 * plane] {
            assert_abs_diff_eq!(v, 0.2, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_bgr_order_puts_blue_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = solid_png(dir.path(), "blue.png", [0, 0, 255]);

        let mut batch = HostInputBatch::new(1, 3, 2, 2).unwrap();
        batch.fill(0, &path).unwrap();
        let data = batch.as_slice().unwrap();
        assert_abs_diff_eq!(data[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(data[8], 0.0, epsilon = 1e-6);
        assert!(batch.is_complete());
    }

    #[test]
    fn test_fill_all_parallel_matches_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            solid_png(dir.path(), "a.png", [10, 20, 30]),
            solid_png(dir.path(), "b.png", [200, 100, 0]),
            solid_png(dir.path(), "c.png", [0, 255, 128]),
        ];

        let mut sequential = HostInputBatch::new(3, 3, 6, 6).unwrap();
        sequential.fill_all(&paths, false).unwrap();
        let mut parallel = HostInputBatch::new(3, 3, 6, 6).unwrap();
        parallel.fill_all(&paths, true).unwrap();

        assert!(parallel.is_complete());
        assert_eq!(sequential.data(), parallel.data());
    }

    #[test]
    fn test_partial_batch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![solid_png(dir.path(), "a.png", [1, 2, 3])];
        let mut batch = HostInputBatch::new(4, 3, 2, 2).unwrap();
        let err = batch.fill_all(&paths, true).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::IncompleteBatch {
                expected: 4,
                got: 1
            }
        ));
        assert_eq!(batch.filled(), 0);
    }

    #[test]
    fn test_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.png");
        std::fs::write(&bogus, b"definitely not a png").unwrap();

        let mut batch = HostInputBatch::new(1, 3, 2, 2).unwrap();
        assert!(matches!(
            batch.fill(0, &bogus),
            Err(ForgeError::DecodeFailed { .. })
        ));
        assert!(matches!(
            batch.fill(0, dir.path().join("missing.png")),
            Err(ForgeError::DecodeFailed { .. })
        ));
        assert!(!batch.is_complete());
    }

    #[test]
    fn test_from_shape_requires_nchw() {
        assert!(HostInputBatch::from_shape(&[2, 3, 8, 8]).is_ok());
        assert!(HostInputBatch::from_shape(&[2, 3]).is_err());
        assert!(HostInputBatch::from_shape(&[2, 4, 8, 8]).is_err());
    }
}
