//! Writes a finished recording to disk.
//!
//! Layout, next to the target file `<dir>/<stem>.<ext>`:
//!
//! - `<dir>/<stem>.<ext>`: every image, oldest first, each the four channel
//!   planes of `n_lines * n_pixels` little-endian `f32`.
//! - `<dir>/scaled_image/[<MODE>/]...bmp`: one contrast-scaled 8-bit bitmap
//!   per channel and image, with the fly-back rows cropped.
//! - `<dir>/<stem>.pulse`: raw frames as little-endian `u16`, when recorded.
//! - `<dir>/<stem>.json`: the session configuration.
//!
//! The first failing write aborts the save. No existing file is ever
//! replaced, and a target named like one of its own companions is refused.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use flim_types::{PipelineEvent, SessionConfig};
use flume::Sender;
use image::{GrayImage, ImageFormat};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::events::publish_display;
use crate::recording::store::SlotStore;

/// What a successful save produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub images: usize,
    pub pulses: usize,
    pub bitmaps: Vec<PathBuf>,
}

/// Position of the `i`-th tile in a serpentine stitching scan `x_step`
/// tiles wide: odd rows run right to left.
pub fn stitch_index(i: usize, x_step: usize) -> usize {
    let x_step = x_step.max(1);
    let (x, y) = (i % x_step, i / x_step);
    let x = if y % 2 == 1 { x_step - x - 1 } else { x };
    x + y * x_step
}

const PULSE_EXTENSION: &str = "pulse";
const CONFIG_EXTENSION: &str = "json";

/// Files written next to the image data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Companions {
    pub dir: PathBuf,
    pub pulse: PathBuf,
    pub config: PathBuf,
}

impl Companions {
    /// Derives the companion paths of `target`, refusing targets that would
    /// be overwritten by one of them.
    pub(crate) fn of(target: &Path) -> PipelineResult<Self> {
        let collides = target
            .extension()
            .and_then(OsStr::to_str)
            .map(|ext| ext.eq_ignore_ascii_case(PULSE_EXTENSION) || ext.eq_ignore_ascii_case(CONFIG_EXTENSION))
            .unwrap_or(false);
        if collides {
            return Err(PipelineError::CompanionCollision(target.to_path_buf()));
        }
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = target
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording".to_string());
        Ok(Self {
            pulse: dir.join(format!("{}.{}", stem, PULSE_EXTENSION)),
            config: dir.join(format!("{}.{}", stem, CONFIG_EXTENSION)),
            dir,
        })
    }

    /// Fails with `FileExists` if any file this save would create is already
    /// on disk.
    pub(crate) fn check_free(&self, target: &Path, with_pulses: bool) -> PipelineResult<()> {
        let mut paths = vec![target, self.config.as_path()];
        if with_pulses {
            paths.push(self.pulse.as_path());
        }
        match paths.into_iter().find(|p| p.exists()) {
            Some(taken) => Err(PipelineError::FileExists(taken.to_path_buf())),
            None => Ok(()),
        }
    }
}

pub(crate) struct SaveJob<'a> {
    pub path: &'a Path,
    pub config: &'a SessionConfig,
    pub images: &'a SlotStore<f32>,
    pub pulses: Option<&'a SlotStore<u16>>,
    pub events: &'a Sender<PipelineEvent>,
}

fn create_new(path: &Path) -> PipelineResult<BufWriter<File>> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => PipelineError::FileExists(path.to_path_buf()),
            _ => PipelineError::IoError(e),
        })?;
    Ok(BufWriter::new(file))
}

impl SaveJob<'_> {
    pub(crate) fn run(&self) -> PipelineResult<SaveReport> {
        let companions = Companions::of(self.path)?;

        let images = self.write_images()?;
        let bitmaps = self.write_bitmaps(&companions.dir)?;
        let pulses = match self.pulses {
            Some(store) => self.write_pulses(store, &companions.pulse)?,
            None => 0,
        };
        self.write_config(&companions.config)?;
        Ok(SaveReport {
            images,
            pulses,
            bitmaps,
        })
    }

    fn write_images(&self) -> PipelineResult<usize> {
        let mut writer = create_new(self.path)?;
        let total = self.images.len();
        let written = self.images.with_filled(|slots| -> PipelineResult<usize> {
            let mut bytes = vec![0u8; self.images.slot_len() * 4];
            for (i, slot) in slots.iter().enumerate() {
                LittleEndian::write_f32_into(slot, &mut bytes);
                writer.write_all(&bytes)?;
                publish_display(
                    self.events,
                    PipelineEvent::SaveProgress {
                        written: i + 1,
                        total,
                    },
                );
            }
            Ok(slots.len())
        })?;
        writer.flush()?;
        info!("Wrote {} images to {:?}", written, self.path);
        Ok(written)
    }

    fn write_bitmaps(&self, dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        let geometry = &self.config.geometry;
        let imaging = &self.config.imaging;
        let recording = &self.config.recording;
        let plane_len = geometry.image_len();
        let rows = geometry.n_lines - imaging.flying_back;
        let cropped_len = rows * geometry.n_pixels;

        let base = dir.join("scaled_image");
        let count = self.images.len();
        let mut written = Vec::new();

        self.images.with_filled(|slots| -> PipelineResult<()> {
            for (i, slot) in slots.iter().enumerate() {
                let tile = stitch_index(i, recording.stitch_x_step);
                for (c, mode) in recording.channel_modes.iter().enumerate() {
                    let contrast = recording.contrast[c];
                    let plane = &slot[c * plane_len..c * plane_len + cropped_len];
                    let pixels: Vec<u8> = plane.iter().map(|&v| contrast.scale(v)).collect();
                    let bitmap = GrayImage::from_raw(geometry.n_pixels as u32, rows as u32, pixels)
                        .ok_or_else(|| PipelineError::InvalidInput {
                            message: "bitmap dimensions do not match image data".to_string(),
                        })?;

                    let folder = if count > 1 { base.join(mode.label()) } else { base.clone() };
                    fs::create_dir_all(&folder)?;
                    let name = format!(
                        "{}_image_acc_{}_avg_{}_[{:.1} {:.1}]_{:03}.bmp",
                        mode.label(),
                        imaging.accumulation_frames,
                        imaging.averaging_frames,
                        contrast.min,
                        contrast.max,
                        tile + 1
                    );
                    let path = folder.join(name);
                    bitmap.save_with_format(&path, ImageFormat::Bmp)?;
                    written.push(path);
                }
            }
            Ok(())
        })?;
        debug!("Wrote {} bitmaps under {:?}", written.len(), base);
        Ok(written)
    }

    fn write_pulses(&self, pulses: &SlotStore<u16>, path: &Path) -> PipelineResult<usize> {
        if pulses.len() == 0 {
            return Ok(0);
        }
        let mut writer = create_new(path)?;
        let written = pulses.with_filled(|slots| -> PipelineResult<usize> {
            let mut bytes = vec![0u8; pulses.slot_len() * 2];
            for slot in slots {
                LittleEndian::write_u16_into(slot, &mut bytes);
                writer.write_all(&bytes)?;
            }
            Ok(slots.len())
        })?;
        writer.flush()?;
        info!("Wrote {} raw frames to {:?}", written, path);
        Ok(written)
    }

    fn write_config(&self, path: &Path) -> PipelineResult<()> {
        let mut writer = create_new(path)?;
        serde_json::to_writer_pretty(&mut writer, self.config)?;
        writer.flush()?;
        Ok(())
    }
}
