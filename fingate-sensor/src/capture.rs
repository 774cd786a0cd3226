use anyhow::{Context, Result};
use image::{GrayImage, ImageBuffer, Luma};
use std::path::Path;

/// Grayscale fingerprint image attached to a capture. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl CaptureImage {
    pub fn from_luma(img: GrayImage) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            pixels: img.into_raw(),
        }
    }

    pub fn to_luma(&self) -> Result<GrayImage> {
        let expected = (self.width * self.height) as usize;
        if self.pixels.len() < expected {
            log::error!(
                "image buffer too small: got {}, expected {}",
                self.pixels.len(),
                expected
            );
            return Err(anyhow::anyhow!("image buffer too small"));
        }
        let buf: ImageBuffer<Luma<u8>, Vec<u8>> =
            ImageBuffer::from_raw(self.width, self.height, self.pixels[..expected].to_vec())
                .ok_or_else(|| anyhow::anyhow!("failed to build image buffer"))?;
        Ok(buf)
    }
}

/// One sensor read: the extracted template plus the raw image, if any.
///
/// Every capture source normalizes its device output through [`Capture::new`],
/// so downstream code always sees a non-empty owned byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    template: Vec<u8>,
    image: Option<CaptureImage>,
}

impl Capture {
    pub fn new(template: impl Into<Vec<u8>>, image: Option<CaptureImage>) -> Result<Self> {
        let template = template.into();
        if template.is_empty() {
            anyhow::bail!("capture produced an empty template");
        }
        Ok(Self { template, image })
    }

    pub fn template(&self) -> &[u8] {
        &self.template
    }

    pub fn image(&self) -> Option<&CaptureImage> {
        self.image.as_ref()
    }

    pub fn into_template(self) -> Vec<u8> {
        self.template
    }

    /// Write the attached image as PNG. Returns `false` when there is no image.
    pub fn save_image(&self, path: &Path) -> Result<bool> {
        let Some(image) = &self.image else {
            return Ok(false);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        image
            .to_luma()?
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(true)
    }
}
