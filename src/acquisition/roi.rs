//! Region of interest and intensity mask.
//!
//! The crop rectangle has a fixed size from configuration and an origin
//! derived from the reference position the controller reports:
//! `(top, left) = (ref_y - dy, ref_x - dx)`. Inside the crop, the mask selects
//! the pixels (value 255) whose mean becomes the intensity.

use std::path::Path;
use tracing::{debug, error};

use crate::config::RoiConfig;
use crate::error::ShotError;
use crate::instrument::camera::{Frame, CHANNELS};

/// Mask value marking a selected pixel.
pub const SELECTED: u8 = 255;

/// Fixed-size 0/255 stencil, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Mask {
    /// Load an 8-bit grayscale PNG. Colour images are converted to luma.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ShotError> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|e| {
                error!("Cannot load mask file {}: {}", path.display(), e);
                ShotError::MaskLoad(format!("{}: {}", path.display(), e))
            })?
            .to_luma8();

        let (width, height) = image.dimensions();
        let mask = Self {
            width,
            height,
            data: image.into_raw(),
        };
        debug!(
            "Loaded mask file {} ({}x{}, {} selected)",
            path.display(),
            height,
            width,
            mask.selected_count()
        );
        Ok(mask)
    }

    /// Mask from raw row-major values.
    ///
    /// # Errors
    /// Returns `MaskLoad` if `data` does not hold `width * height` values.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ShotError> {
        if data.len() != width as usize * height as usize {
            return Err(ShotError::MaskLoad(format!(
                "{}x{} mask needs {} values, got {}",
                height,
                width,
                width as usize * height as usize,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Mask selecting every pixel.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![SELECTED; width as usize * height as usize],
        }
    }

    /// Mask width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Mask height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Whether the pixel at column `x`, row `y` contributes to the mean.
    pub fn is_selected(&self, x: u32, y: u32) -> bool {
        self.data[y as usize * self.width as usize + x as usize] == SELECTED
    }

    /// Select or clear a pixel.
    pub fn set_selected(&mut self, x: u32, y: u32, selected: bool) {
        self.data[y as usize * self.width as usize + x as usize] = if selected { SELECTED } else { 0 };
    }

    /// Number of selected pixels.
    pub fn selected_count(&self) -> usize {
        self.data.iter().filter(|&&v| v == SELECTED).count()
    }

    /// Check the mask against the configured crop size.
    pub fn validate(&self, roi: &RoiConfig) -> Result<(), ShotError> {
        if self.height != roi.height || self.width != roi.width {
            error!(
                "Invalid mask file: {}x{} does not match ROI {}x{}",
                self.height, self.width, roi.height, roi.width
            );
            return Err(ShotError::MaskShape {
                expected_height: roi.height,
                expected_width: roi.width,
                height: self.height,
                width: self.width,
            });
        }
        if self.selected_count() == 0 {
            error!("Invalid mask file: no pixel selected");
            return Err(ShotError::MaskEmpty);
        }
        Ok(())
    }
}

/// Crop rectangle placed on the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    /// First row
    pub top: u32,
    /// First column
    pub left: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Roi {
    /// Place the configured crop relative to the reference position `(x, y)`.
    ///
    /// # Errors
    /// Returns `InvalidReference` if the origin would be negative or does not
    /// fit an `i32`.
    pub fn from_reference(reference: (i32, i32), config: &RoiConfig) -> Result<Self, ShotError> {
        let (x, y) = reference;
        let offset = |position: i32, delta: i32| {
            position
                .checked_sub(delta)
                .and_then(|origin| u32::try_from(origin).ok())
        };
        match (offset(y, config.dy), offset(x, config.dx)) {
            (Some(top), Some(left)) => Ok(Self {
                top,
                left,
                width: config.width,
                height: config.height,
            }),
            _ => {
                error!(
                    "Reference position ({}, {}) puts the ROI outside the frame",
                    x, y
                );
                Err(ShotError::InvalidReference { x, y })
            }
        }
    }

    /// Copy the rectangle out of `frame`.
    pub fn crop(&self, frame: &Frame) -> Result<Frame, ShotError> {
        frame
            .crop(self.top, self.left, self.width, self.height)
            .ok_or(ShotError::RoiOutOfFrame)
    }
}

/// Mean of `channel` over the selected pixels, scaled by 256 and truncated.
pub fn compute_intensity(crop: &Frame, mask: &Mask, channel: usize) -> Result<i32, ShotError> {
    if crop.width() != mask.width || crop.height() != mask.height {
        return Err(ShotError::MaskShape {
            expected_height: crop.height(),
            expected_width: crop.width(),
            height: mask.height,
            width: mask.width,
        });
    }

    let mut sum: u64 = 0;
    let mut count: u64 = 0;
    for (pixel, &m) in crop.as_bytes().chunks_exact(CHANNELS).zip(&mask.data) {
        if m == SELECTED {
            sum += u64::from(pixel[channel]);
            count += 1;
        }
    }
    if count == 0 {
        return Err(ShotError::MaskEmpty);
    }

    let mean = sum as f64 / count as f64;
    Ok((mean * 256.0) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi_config(width: u32, height: u32) -> RoiConfig {
        RoiConfig {
            dx: 10,
            dy: 5,
            width,
            height,
        }
    }

    #[test]
    fn test_mask_shape_must_match_roi() {
        let mask = Mask::full(4, 3);
        assert!(mask.validate(&roi_config(4, 3)).is_ok());
        assert_eq!(
            mask.validate(&roi_config(3, 4)),
            Err(ShotError::MaskShape {
                expected_height: 4,
                expected_width: 3,
                height: 3,
                width: 4,
            })
        );
    }

    #[test]
    fn test_empty_mask_rejected() {
        let mask = Mask::from_raw(2, 2, vec![0, 0, 0, 0]).unwrap();
        assert_eq!(mask.validate(&roi_config(2, 2)), Err(ShotError::MaskEmpty));
    }

    #[test]
    fn test_origin_from_reference() {
        let roi = Roi::from_reference((100, 50), &roi_config(4, 3)).unwrap();
        assert_eq!((roi.top, roi.left), (45, 90));

        assert_eq!(
            Roi::from_reference((5, 50), &roi_config(4, 3)),
            Err(ShotError::InvalidReference { x: 5, y: 50 })
        );
    }

    #[test]
    fn test_extreme_reference_is_rejected() {
        assert_eq!(
            Roi::from_reference((i32::MIN, 0), &roi_config(4, 3)),
            Err(ShotError::InvalidReference { x: i32::MIN, y: 0 })
        );

        let mut config = roi_config(4, 3);
        config.dy = -5;
        assert_eq!(
            Roi::from_reference((100, i32::MAX), &config),
            Err(ShotError::InvalidReference { x: 100, y: i32::MAX })
        );
    }

    #[test]
    fn test_crop_outside_frame() {
        let roi = Roi {
            top: 8,
            left: 0,
            width: 4,
            height: 4,
        };
        let frame = Frame::filled(10, 10, [0, 0, 0]);
        assert_eq!(roi.crop(&frame), Err(ShotError::RoiOutOfFrame));
    }

    #[test]
    fn test_intensity_uses_selected_pixels_of_channel() {
        // Green 100 everywhere except one unselected pixel at 250
        let mut crop = Frame::filled(2, 2, [7, 100, 200]);
        crop.set_pixel(1, 1, [7, 250, 200]);
        let mut mask = Mask::full(2, 2);
        mask.set_selected(1, 1, false);

        assert_eq!(compute_intensity(&crop, &mask, 1).unwrap(), 100 * 256);
        assert_eq!(compute_intensity(&crop, &mask, 2).unwrap(), 200 * 256);
    }

    #[test]
    fn test_intensity_is_truncated() {
        let mut crop = Frame::filled(3, 1, [0, 1, 0]);
        crop.set_pixel(2, 0, [0, 2, 0]);
        // mean = 4/3, * 256 = 341.33
        assert_eq!(compute_intensity(&crop, &Mask::full(3, 1), 1).unwrap(), 341);
    }

    #[test]
    fn test_load_png_mask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        let mut image = image::GrayImage::new(3, 2);
        image.put_pixel(1, 0, image::Luma([255]));
        image.save(&path).unwrap();

        let mask = Mask::load(&path).unwrap();
        assert_eq!((mask.width(), mask.height()), (3, 2));
        assert!(mask.is_selected(1, 0));
        assert_eq!(mask.selected_count(), 1);
    }

    #[test]
    fn test_missing_mask_file() {
        assert!(matches!(
            Mask::load("/nonexistent/mask.png"),
            Err(ShotError::MaskLoad(_))
        ));
    }
}
