use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::capture::{Capture, CaptureImage};

/// Extension of template files dropped into the spool directory.
pub const TEMPLATE_EXT: &str = "tpl";

const IMAGE_EXTS: [&str; 4] = ["png", "bmp", "pgm", "pnm"];

/// A device that yields captures at its own pace.
pub trait CaptureSource: Send {
    /// Poll for the next capture. `Ok(None)` means nothing is on the sensor.
    /// Errors mean the device is gone and polling should stop.
    fn acquire(&mut self) -> Result<Option<Capture>>;

    /// Release the device. Further `acquire` calls fail.
    fn terminate(&mut self);
}

impl<T: CaptureSource + ?Sized> CaptureSource for Box<T> {
    fn acquire(&mut self) -> Result<Option<Capture>> {
        (**self).acquire()
    }

    fn terminate(&mut self) {
        (**self).terminate()
    }
}

/// Capture source backed by a spool directory.
///
/// An external scanner daemon (or an operator) drops `<name>.tpl` files into
/// the directory, optionally with a `<name>.png` image next to them. Each file
/// is consumed exactly once, oldest first.
///
/// Writers must publish a template atomically: write `<name>.tpl.part` (and
/// the image) first, then rename it to `<name>.tpl`. Any file that does not
/// end in `.tpl` is ignored. A template that vanishes before it is read was
/// taken by someone else and is skipped.
pub struct SpoolSource {
    dir: PathBuf,
    terminated: bool,
}

impl SpoolSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let meta = fs::metadata(dir).with_context(|| format!("open spool {}", dir.display()))?;
        if !meta.is_dir() {
            anyhow::bail!("spool {} is not a directory", dir.display());
        }
        log::info!("spool source opened: {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            terminated: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pending templates, oldest first.
    fn pending(&self) -> Result<Vec<PathBuf>> {
        let mut pending: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir).context("read spool")? {
            let entry = entry.context("read spool entry")?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXT) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            pending.push((modified, path));
        }
        pending.sort();
        Ok(pending.into_iter().map(|(_, path)| path).collect())
    }

    fn load_image(template_path: &Path) -> Option<(PathBuf, CaptureImage)> {
        IMAGE_EXTS
            .iter()
            .map(|ext| template_path.with_extension(ext))
            .find(|p| p.exists())
            .and_then(|path| match image::open(&path) {
                Ok(img) => Some((path, CaptureImage::from_luma(img.to_luma8()))),
                Err(e) => {
                    log::warn!("ignoring unreadable image {}: {}", path.display(), e);
                    // still remove it with the template
                    let _ = fs::remove_file(&path);
                    None
                }
            })
    }

    /// Read and remove one template. `None` if it disappeared in between.
    fn take(path: &Path) -> Result<Option<(Vec<u8>, Option<CaptureImage>)>> {
        let template = match fs::read(path) {
            Ok(template) => template,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} vanished before it was read", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let image = Self::load_image(path);

        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} consumed elsewhere", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("consuming {}", path.display())),
        }
        let image = image.map(|(image_path, image)| {
            let _ = fs::remove_file(image_path);
            image
        });
        Ok(Some((template, image)))
    }

    fn normalize(path: &Path, template: Vec<u8>, image: Option<CaptureImage>) -> Option<Capture> {
        match Capture::new(template, image) {
            Ok(capture) => {
                log::debug!(
                    "captured {}: template len={} image={:?}",
                    path.display(),
                    capture.template().len(),
                    capture.image().map(|i| (i.width, i.height))
                );
                Some(capture)
            }
            Err(e) => {
                log::warn!("discarding {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl CaptureSource for SpoolSource {
    fn acquire(&mut self) -> Result<Option<Capture>> {
        if self.terminated {
            anyhow::bail!("spool source {} terminated", self.dir.display());
        }
        for path in self.pending()? {
            if let Some((template, image)) = Self::take(&path)? {
                return Ok(Self::normalize(&path, template, image));
            }
        }
        Ok(None)
    }

    fn terminate(&mut self) {
        if !self.terminated {
            log::info!("spool source released: {}", self.dir.display());
            self.terminated = true;
        }
    }
}
