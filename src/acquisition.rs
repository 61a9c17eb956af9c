//! Acquisition management: named, bounded image sets that may be mirrored to disk.

use crate::error::AcquisitionError;
use crate::hardware::Frame;
use image::{ImageBuffer, Luma};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FrameCoords {
    pub channel: u32,
    pub slice: u32,
    pub frame: u32,
    pub position: u32,
}

impl FrameCoords {
    /// Single channel, single slice, single position.
    pub fn frame(frame: u32) -> Self {
        Self {
            channel: 0,
            slice: 0,
            frame,
            position: 0,
        }
    }
}

impl fmt::Display for FrameCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "c{} z{} t{} p{}",
            self.channel, self.slice, self.frame, self.position
        )
    }
}

/// Parameters of [`AcquisitionSink::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAcquisition {
    pub name: String,
    pub root: PathBuf,
    pub channels: u32,
    pub slices: u32,
    pub frames: u32,
    pub positions: u32,
    pub show: bool,
    pub save: bool,
    /// Free-form metadata stored with the acquisition.
    pub summary: Map<String, Value>,
}

impl OpenAcquisition {
    fn contains(&self, coords: &FrameCoords) -> bool {
        coords.channel < self.channels
            && coords.slice < self.slices
            && coords.frame < self.frames
            && coords.position < self.positions
    }

    fn bounds(&self) -> String {
        format!(
            "{} channels x {} slices x {} frames x {} positions",
            self.channels, self.slices, self.frames, self.positions
        )
    }
}

pub trait AcquisitionSink {
    /// Closes and forgets every acquisition.
    fn close_all(&mut self) -> Result<(), AcquisitionError>;

    /// Returns `prefix` itself or `prefix` with a numeric suffix, whichever is free.
    fn unique_name(&mut self, prefix: &str) -> Result<String, AcquisitionError>;

    fn open(&mut self, request: &OpenAcquisition) -> Result<(), AcquisitionError>;

    fn insert_frame(
        &mut self,
        name: &str,
        coords: FrameCoords,
        frame: Frame,
    ) -> Result<(), AcquisitionError>;

    fn close(&mut self, name: &str) -> Result<(), AcquisitionError>;
}

#[derive(Debug)]
pub struct Acquisition {
    layout: OpenAcquisition,
    frames: BTreeMap<FrameCoords, Frame>,
    directory: Option<PathBuf>,
    open: bool,
}

impl Acquisition {
    pub fn layout(&self) -> &OpenAcquisition {
        &self.layout
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Frame filed at `coords`. Once a saved acquisition is closed its frames
    /// keep their shape and tags but the pixels live only on disk.
    pub fn frame(&self, coords: &FrameCoords) -> Option<&Frame> {
        self.frames.get(coords)
    }

    pub fn frames(&self) -> impl Iterator<Item = (&FrameCoords, &Frame)> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Where images are written, if the acquisition is being saved.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    fn check_shape(&self, frame: &Frame) -> Result<(), AcquisitionError> {
        let expected = (frame.width as usize) * (frame.height as usize);
        if frame.pixels.len() != expected {
            return Err(AcquisitionError::ShapeMismatch {
                name: self.layout.name.clone(),
                expected: format!("{} pixels", expected),
                got: format!("{} pixels", frame.pixels.len()),
            });
        }
        match self.frames.values().next() {
            Some(first) if (first.width, first.height) != (frame.width, frame.height) => {
                Err(AcquisitionError::ShapeMismatch {
                    name: self.layout.name.clone(),
                    expected: format!("{}x{}", first.width, first.height),
                    got: format!("{}x{}", frame.width, frame.height),
                })
            }
            _ => Ok(()),
        }
    }

    fn write_frame(&self, coords: &FrameCoords, frame: &Frame) -> Result<(), AcquisitionError> {
        let Some(dir) = &self.directory else {
            return Ok(());
        };
        let path = dir.join(image_file_name(coords));
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(frame.width, frame.height, frame.pixels.clone()).ok_or_else(
                || self.storage_error(format!("{}: pixel buffer too small", path.display())),
            )?;
        buffer
            .save(&path)
            .map_err(|e| self.storage_error(format!("{}: {}", path.display(), e)))?;
        debug!("已保存 {}", path.display());
        Ok(())
    }

    fn write_metadata(&self) -> Result<(), AcquisitionError> {
        let Some(dir) = &self.directory else {
            return Ok(());
        };
        let frames: Vec<Value> = self
            .frames
            .iter()
            .map(|(coords, frame)| {
                json!({
                    "coords": coords,
                    "file": image_file_name(coords),
                    "width": frame.width,
                    "height": frame.height,
                    "tags": frame.tags,
                })
            })
            .collect();
        let metadata = json!({
            "name": self.layout.name,
            "channels": self.layout.channels,
            "slices": self.layout.slices,
            "frames": self.layout.frames,
            "positions": self.layout.positions,
            "summary": self.layout.summary,
            "images": frames,
        });
        let path = dir.join("metadata.json");
        let text = serde_json::to_string_pretty(&metadata)
            .map_err(|e| self.storage_error(e.to_string()))?;
        fs::write(&path, text)
            .map_err(|e| self.storage_error(format!("{}: {}", path.display(), e)))
    }

    fn release_saved_pixels(&mut self) {
        if self.directory.is_none() {
            return;
        }
        for frame in self.frames.values_mut() {
            frame.pixels = Vec::new();
        }
    }

    fn storage_error(&self, reason: String) -> AcquisitionError {
        AcquisitionError::Storage {
            name: self.layout.name.clone(),
            reason,
        }
    }
}

fn image_file_name(coords: &FrameCoords) -> String {
    format!(
        "img_channel{:03}_position{:03}_time{:09}_z{:03}.png",
        coords.channel, coords.position, coords.frame, coords.slice
    )
}

/// First free `root/name`, `root/name_1`, `root/name_2`, ...
fn unused_directory(root: &Path, name: &str) -> PathBuf {
    let mut candidate = root.join(name);
    let mut n = 1;
    while candidate.exists() {
        candidate = root.join(format!("{}_{}", name, n));
        n += 1;
    }
    candidate
}

/// In-process acquisition manager.
#[derive(Debug, Default)]
pub struct AcquisitionStore {
    acquisitions: BTreeMap<String, Acquisition>,
}

impl AcquisitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Acquisition> {
        self.acquisitions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.acquisitions.keys().map(String::as_str)
    }

    fn open_acquisition(&mut self, name: &str) -> Result<&mut Acquisition, AcquisitionError> {
        match self.acquisitions.get_mut(name) {
            Some(acq) if acq.open => Ok(acq),
            _ => Err(AcquisitionError::NotOpen(name.to_string())),
        }
    }
}

impl AcquisitionSink for AcquisitionStore {
    fn close_all(&mut self) -> Result<(), AcquisitionError> {
        let names: Vec<String> = self
            .acquisitions
            .iter()
            .filter(|(_, acq)| acq.open)
            .map(|(name, _)| name.clone())
            .collect();
        let mut first_error = None;
        for name in names {
            if let Err(e) = self.close(&name) {
                warn!("关闭采集 {} 失败: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        self.acquisitions.clear();
        first_error.map_or(Ok(()), Err)
    }

    fn unique_name(&mut self, prefix: &str) -> Result<String, AcquisitionError> {
        let prefix = match prefix.trim() {
            "" => "Acq",
            p => p,
        };
        if !self.acquisitions.contains_key(prefix) {
            return Ok(prefix.to_string());
        }
        let name = (1..)
            .map(|n| format!("{}_{}", prefix, n))
            .find(|candidate| !self.acquisitions.contains_key(candidate))
            .unwrap_or_default();
        Ok(name)
    }

    fn open(&mut self, request: &OpenAcquisition) -> Result<(), AcquisitionError> {
        if self.acquisitions.contains_key(&request.name) {
            return Err(AcquisitionError::AlreadyOpen(request.name.clone()));
        }
        let directory = if request.save {
            let dir = unused_directory(&request.root, &request.name);
            fs::create_dir_all(&dir).map_err(|e| AcquisitionError::Storage {
                name: request.name.clone(),
                reason: format!("{}: {}", dir.display(), e),
            })?;
            info!("采集 {} 将保存到 {}", request.name, dir.display());
            Some(dir)
        } else {
            None
        };
        info!("打开采集 {} ({})", request.name, request.bounds());
        self.acquisitions.insert(
            request.name.clone(),
            Acquisition {
                layout: request.clone(),
                frames: BTreeMap::new(),
                directory,
                open: true,
            },
        );
        Ok(())
    }

    fn insert_frame(
        &mut self,
        name: &str,
        coords: FrameCoords,
        frame: Frame,
    ) -> Result<(), AcquisitionError> {
        let acq = self.open_acquisition(name)?;
        if !acq.layout.contains(&coords) {
            return Err(AcquisitionError::OutOfBounds {
                name: name.to_string(),
                coords: coords.to_string(),
                bounds: acq.layout.bounds(),
            });
        }
        acq.check_shape(&frame)?;
        acq.write_frame(&coords, &frame)?;
        acq.frames.insert(coords, frame);
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<(), AcquisitionError> {
        let acq = self.open_acquisition(name)?;
        acq.open = false;
        let written = acq.write_metadata();
        acq.release_saved_pixels();
        written?;
        info!("采集 {} 已关闭，共 {} 帧", name, acq.frames.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, frames: u32) -> OpenAcquisition {
        OpenAcquisition {
            name: name.to_string(),
            root: PathBuf::new(),
            channels: 1,
            slices: 1,
            frames,
            positions: 1,
            show: true,
            save: false,
            summary: Map::new(),
        }
    }

    fn tagged(angle: i64) -> Frame {
        let mut frame = Frame::new(2, 2, vec![1, 2, 3, 4]);
        frame.tag_angle(angle);
        frame
    }

    #[test]
    fn unique_names_get_a_suffix() {
        let mut store = AcquisitionStore::new();
        assert_eq!(store.unique_name("saim").unwrap(), "saim");
        store.open(&request("saim", 1)).unwrap();
        assert_eq!(store.unique_name("saim").unwrap(), "saim_1");
        store.open(&request("saim_1", 1)).unwrap();
        assert_eq!(store.unique_name("saim").unwrap(), "saim_2");
        assert_eq!(store.unique_name("  ").unwrap(), "Acq");
    }

    #[test]
    fn frames_are_bounded_by_the_layout() {
        let mut store = AcquisitionStore::new();
        store.open(&request("a", 2)).unwrap();
        store.insert_frame("a", FrameCoords::frame(1), tagged(0)).unwrap();
        let err = store
            .insert_frame("a", FrameCoords::frame(2), tagged(10))
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::OutOfBounds { .. }));
        let acq = store.get("a").unwrap();
        assert_eq!(acq.len(), 1);
        assert_eq!(acq.frame(&FrameCoords::frame(1)).unwrap().angle(), Some(0));
    }

    #[test]
    fn frame_shape_must_stay_constant() {
        let mut store = AcquisitionStore::new();
        store.open(&request("a", 3)).unwrap();
        store.insert_frame("a", FrameCoords::frame(0), tagged(0)).unwrap();
        let odd = Frame::new(1, 4, vec![0; 4]);
        assert!(matches!(
            store.insert_frame("a", FrameCoords::frame(1), odd),
            Err(AcquisitionError::ShapeMismatch { .. })
        ));
        let short = Frame::new(2, 2, vec![0; 3]);
        assert!(store.insert_frame("a", FrameCoords::frame(1), short).is_err());
    }

    #[test]
    fn closed_acquisitions_reject_frames() {
        let mut store = AcquisitionStore::new();
        store.open(&request("a", 2)).unwrap();
        assert_eq!(
            store.open(&request("a", 2)),
            Err(AcquisitionError::AlreadyOpen("a".to_string()))
        );
        store.close("a").unwrap();
        assert!(!store.get("a").unwrap().is_open());
        assert_eq!(
            store.insert_frame("a", FrameCoords::frame(0), tagged(0)),
            Err(AcquisitionError::NotOpen("a".to_string()))
        );
        assert_eq!(store.close("a"), Err(AcquisitionError::NotOpen("a".to_string())));
        assert_eq!(
            store.close("missing"),
            Err(AcquisitionError::NotOpen("missing".to_string()))
        );
    }

    #[test]
    fn close_all_forgets_everything() {
        let mut store = AcquisitionStore::new();
        store.open(&request("a", 1)).unwrap();
        store.open(&request("b", 1)).unwrap();
        store.close("b").unwrap();
        store.close_all().unwrap();
        assert_eq!(store.names().count(), 0);
        assert_eq!(store.unique_name("a").unwrap(), "a");
    }

    #[test]
    fn saved_acquisitions_write_images_and_metadata() {
        let root = tempfile::tempdir().unwrap();
        let mut store = AcquisitionStore::new();
        let mut req = request("run", 2);
        req.root = root.path().to_path_buf();
        req.save = true;
        req.summary.insert("DoubleZero".to_string(), json!(false));

        // an existing directory is not overwritten
        fs::create_dir_all(root.path().join("run")).unwrap();
        store.open(&req).unwrap();
        let dir = store.get("run").unwrap().directory().unwrap().to_path_buf();
        assert_eq!(dir, root.path().join("run_1"));

        store.insert_frame("run", FrameCoords::frame(0), tagged(-10)).unwrap();
        store.insert_frame("run", FrameCoords::frame(1), tagged(0)).unwrap();
        store.close("run").unwrap();

        let first = dir.join("img_channel000_position000_time000000000_z000.png");
        let decoded = image::open(&first).unwrap().into_luma16();
        assert_eq!(decoded.dimensions(), (2, 2));
        assert_eq!(decoded.into_raw(), vec![1, 2, 3, 4]);

        let metadata: Value =
            serde_json::from_str(&fs::read_to_string(dir.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(metadata["summary"]["DoubleZero"], json!(false));
        assert_eq!(metadata["images"][0]["tags"]["Angle"], json!(-10));
        assert_eq!(metadata["images"][1]["coords"]["frame"], json!(1));

        // pixels stay on disk only; shape and tags remain in memory
        let acq = store.get("run").unwrap();
        assert_eq!(acq.len(), 2);
        let kept = acq.frame(&FrameCoords::frame(0)).unwrap();
        assert!(kept.pixels.is_empty());
        assert_eq!((kept.width, kept.height), (2, 2));
        assert_eq!(kept.angle(), Some(-10));
    }

    #[test]
    fn unsaved_acquisitions_keep_pixels_after_close() {
        let mut store = AcquisitionStore::new();
        store.open(&request("a", 1)).unwrap();
        store.insert_frame("a", FrameCoords::frame(0), tagged(5)).unwrap();
        store.close("a").unwrap();
        let frame = store.get("a").unwrap().frame(&FrameCoords::frame(0)).unwrap();
        assert_eq!(frame.pixels, vec![1, 2, 3, 4]);
    }
}
