//! Dataset bookkeeping: runs, wedges and frame ranges.
//!
//! A *run* is the user's description of an exposure sequence: angular range,
//! per-frame delta, exposure time and the hardware setpoints it should be
//! collected at. Before acquisition a run is expanded into *wedges*,
//! contiguous angular blocks sharing fixed setpoints, with frames that are
//! skipped or already on disk carved out. Wedges are consumed in angular
//! order and never mutated after generation.
//!
//! Frame ranges travel as compact *frameset strings* such as `"1-4,6-8"`.
//! Resume logic recomputes these from a disk scan rather than trusting
//! in-memory state, so it stays correct across manual intervention between a
//! pause and a resume.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AppResult;

/// Width of the zero-padded frame number in file names.
pub const FRAME_NUMBER_DIGITS: usize = 4;

/// User-level parameters for one exposure sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Dataset name; also the file name prefix.
    pub name: String,
    /// Directory frames and summaries are written to.
    pub directory: PathBuf,
    /// Beam energy in keV.
    pub energy: f64,
    /// Detector distance in mm.
    pub distance: f64,
    /// Attenuation in percent.
    pub attenuation: f64,
    /// Exposure time per frame in seconds.
    pub exposure: f64,
    /// Oscillation per frame in degrees.
    pub delta: f64,
    /// Start angle in degrees.
    pub start: f64,
    /// Total angular range in degrees.
    pub range: f64,
    /// Maximum contiguous degrees collected at fixed setpoints.
    pub wedge: f64,
    /// First frame number.
    pub first: u32,
    /// Frames the user asked to skip, as a frameset string.
    #[serde(default)]
    pub skip: String,
    /// Frames already on disk, as a frameset string. Recomputed on resume.
    #[serde(default)]
    pub existing: String,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            name: "dataset".to_string(),
            directory: PathBuf::from("."),
            energy: 12.658,
            distance: 250.0,
            attenuation: 0.0,
            exposure: 1.0,
            delta: 1.0,
            start: 0.0,
            range: 180.0,
            wedge: 180.0,
            first: 1,
            skip: String::new(),
            existing: String::new(),
        }
    }
}

impl Run {
    /// Total number of frames spanned by the angular range.
    pub fn total_frames(&self) -> u32 {
        if self.delta <= 0.0 || self.range <= 0.0 {
            return 1;
        }
        ((self.range / self.delta).round() as u32).max(1)
    }

    /// Frame numbers remaining after skip and existing ranges are removed.
    pub fn frame_numbers(&self) -> Vec<u32> {
        let excluded = self.excluded();
        (0..self.total_frames())
            .map(|i| self.first + i)
            .filter(|frame| !excluded.contains(frame))
            .collect()
    }

    fn excluded(&self) -> BTreeSet<u32> {
        parse_frameset(&merge_framesets(&[&self.skip, &self.existing]))
            .into_iter()
            .collect()
    }

    /// File name for one frame of this run.
    pub fn frame_file(&self, frame: u32, extension: &str) -> String {
        format!(
            "{}_{:0width$}.{}",
            self.name,
            frame,
            extension,
            width = FRAME_NUMBER_DIGITS
        )
    }
}

/// One contiguous angular block of exposures sharing fixed setpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wedge {
    pub name: String,
    pub directory: PathBuf,
    pub energy: f64,
    pub distance: f64,
    pub attenuation: f64,
    pub exposure: f64,
    pub delta: f64,
    /// Start angle of the wedge in degrees.
    pub start: f64,
    /// First frame number of the wedge.
    pub first: u32,
    pub num_frames: u32,
}

impl Wedge {
    /// Start angle of the i-th frame within the wedge.
    pub fn frame_angle(&self, index: u32) -> f64 {
        self.start + f64::from(index) * self.delta
    }

    pub fn frame_number(&self, index: u32) -> u32 {
        self.first + index
    }

    /// Raw exposure time for the whole wedge.
    pub fn total_exposure(&self) -> f64 {
        self.exposure * f64::from(self.num_frames)
    }

    pub fn angle_range(&self) -> f64 {
        self.delta * f64::from(self.num_frames)
    }

    pub fn frame_file(&self, frame: u32, extension: &str) -> String {
        format!(
            "{}_{:0width$}.{}",
            self.name,
            frame,
            extension,
            width = FRAME_NUMBER_DIGITS
        )
    }
}

/// Expand a run into wedges, carving out skipped and existing frames.
///
/// A new wedge begins at every wedge-size boundary and after every excluded
/// frame, so each produced wedge covers a strictly contiguous frame range.
pub fn make_wedges(run: &Run) -> Vec<Wedge> {
    let total = run.total_frames();
    let wedge_span = if run.wedge > 0.0 {
        run.wedge.min(run.range)
    } else {
        run.range
    };
    let frames_per_wedge = if run.delta > 0.0 {
        ((wedge_span / run.delta).round() as u32).max(1)
    } else {
        1
    };
    let excluded = run.excluded();

    let mut wedges = Vec::new();
    let mut chunk: Vec<u32> = Vec::new();
    for index in 0..total {
        if index % frames_per_wedge == 0 {
            flush_chunk(run, &mut chunk, &mut wedges);
        }
        let frame = run.first + index;
        if excluded.contains(&frame) {
            flush_chunk(run, &mut chunk, &mut wedges);
            continue;
        }
        chunk.push(frame);
    }
    flush_chunk(run, &mut chunk, &mut wedges);
    debug!(
        run = %run.name,
        wedges = wedges.len(),
        excluded = excluded.len(),
        "expanded run into wedges"
    );
    wedges
}

fn flush_chunk(run: &Run, chunk: &mut Vec<u32>, wedges: &mut Vec<Wedge>) {
    if chunk.is_empty() {
        return;
    }
    let first = chunk[0];
    wedges.push(Wedge {
        name: run.name.clone(),
        directory: run.directory.clone(),
        energy: run.energy,
        distance: run.distance,
        attenuation: run.attenuation,
        exposure: run.exposure,
        delta: run.delta,
        start: run.start + f64::from(first - run.first) * run.delta,
        first,
        num_frames: chunk.len() as u32,
    });
    chunk.clear();
}

/// Reduce a list of frame numbers to a compact range string.
///
/// `[1,2,3,4,6,7,8]` becomes `"1-4,6-8"`.
pub fn summarize_frames(frames: &[u32]) -> String {
    let ordered: BTreeSet<u32> = frames.iter().copied().collect();
    let mut parts: Vec<String> = Vec::new();
    let mut pair: Option<(u32, u32)> = None;
    for frame in ordered {
        match pair {
            Some((start, end)) if frame == end + 1 => pair = Some((start, frame)),
            Some((start, end)) => {
                parts.push(format_range(start, end));
                pair = Some((frame, frame));
            }
            None => pair = Some((frame, frame)),
        }
    }
    if let Some((start, end)) = pair {
        parts.push(format_range(start, end));
    }
    parts.join(",")
}

fn format_range(start: u32, end: u32) -> String {
    if start == end {
        format!("{start}")
    } else {
        format!("{start}-{end}")
    }
}

/// Expand a frameset string back into sorted frame numbers.
///
/// Malformed fragments are ignored rather than failing the whole parse.
pub fn parse_frameset(text: &str) -> Vec<u32> {
    let mut frames = BTreeSet::new();
    for part in text.split(',').filter(|p| !p.is_empty()) {
        let bounds: Vec<&str> = part.splitn(2, '-').collect();
        match bounds.as_slice() {
            [single] => {
                if let Ok(frame) = single.trim().parse::<u32>() {
                    frames.insert(frame);
                }
            }
            [start, end] => {
                if let (Ok(start), Ok(end)) =
                    (start.trim().parse::<u32>(), end.trim().parse::<u32>())
                {
                    for frame in start..=end.max(start) {
                        frames.insert(frame);
                    }
                }
            }
            _ => {}
        }
    }
    frames.into_iter().collect()
}

/// Merge several frameset strings into one normalized string.
pub fn merge_framesets(parts: &[&str]) -> String {
    let mut frames = Vec::new();
    for part in parts {
        frames.extend(parse_frameset(part));
    }
    summarize_frames(&frames)
}

/// Frame numbers of `name` datasets found on disk.
///
/// This is the disk-truth primitive behind resume: it reads the directory
/// every time instead of trusting any in-memory record, so frames deleted or
/// added by hand between a pause and a resume are honoured.
pub fn scan_existing(directory: &Path, name: &str, extension: &str) -> Vec<u32> {
    let pattern = format!(
        r"^{}_(\d{{{}}})\.{}$",
        regex::escape(name),
        FRAME_NUMBER_DIGITS,
        regex::escape(extension)
    );
    let Ok(matcher) = Regex::new(&pattern) else {
        return Vec::new();
    };
    let Ok(entries) = fs::read_dir(directory) else {
        // No directory yet means no frames yet.
        return Vec::new();
    };
    let mut frames: Vec<u32> = entries
        .flatten()
        .filter_map(|entry| {
            let file_name = entry.file_name();
            let text = file_name.to_string_lossy();
            matcher
                .captures(&text)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
        })
        .collect();
    frames.sort_unstable();
    frames
}

/// Per-dataset acquisition summary, persisted next to the frames.
///
/// One file exists per dataset name. On every save the file is merged, not
/// overwritten, so identifiers assigned by the reporting service survive
/// re-collection after a resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Identifier assigned by the reporting service, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub directory: PathBuf,
    /// Frames present on disk, as a frameset string.
    pub frames: String,
    pub num_frames: u32,
    pub energy: f64,
    pub distance: f64,
    pub attenuation: f64,
    pub exposure: f64,
    pub start_angle: f64,
    pub delta: f64,
    pub beamline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl DatasetSummary {
    /// Path of the summary file for a dataset.
    pub fn path(directory: &Path, name: &str) -> PathBuf {
        directory.join(format!("{name}.meta.json"))
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Merge with any prior summary for the same dataset and write the file.
    ///
    /// Returns the merged summary that was written.
    pub fn save_merged(mut self) -> AppResult<Self> {
        let path = Self::path(&self.directory, &self.name);
        match Self::load(&path) {
            Ok(prior) => {
                self.id = self.id.or(prior.id);
                self.frames = merge_framesets(&[&prior.frames, &self.frames]);
                self.num_frames = parse_frameset(&self.frames).len() as u32;
                self.start_time = match (prior.start_time, self.start_time) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            Err(err) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %err, "unreadable prior summary, overwriting");
                }
            }
        }
        fs::create_dir_all(&self.directory)?;
        fs::write(&path, serde_json::to_string_pretty(&self)?)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_frameset_round_trip() {
        let frames = vec![1, 2, 3, 4, 6, 7, 8, 12];
        let text = summarize_frames(&frames);
        assert_eq!(text, "1-4,6-8,12");
        assert_eq!(parse_frameset(&text), frames);
        assert_eq!(summarize_frames(&[]), "");
        assert_eq!(parse_frameset(""), Vec::<u32>::new());
    }

    #[test]
    fn test_merge_framesets() {
        assert_eq!(merge_framesets(&["1-3", "3-5", "9"]), "1-5,9");
        assert_eq!(merge_framesets(&["", ""]), "");
    }

    #[test]
    fn test_single_wedge_run() {
        let run = Run {
            name: "lysozyme".to_string(),
            range: 10.0,
            delta: 1.0,
            wedge: 180.0,
            ..Run::default()
        };
        let wedges = make_wedges(&run);
        assert_eq!(wedges.len(), 1);
        assert_eq!(wedges[0].first, 1);
        assert_eq!(wedges[0].num_frames, 10);
        assert!((wedges[0].start - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_wedge_boundaries() {
        let run = Run {
            range: 10.0,
            delta: 1.0,
            wedge: 4.0,
            ..Run::default()
        };
        let wedges = make_wedges(&run);
        let sizes: Vec<u32> = wedges.iter().map(|w| w.num_frames).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(wedges[1].first, 5);
        assert!((wedges[1].start - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_existing_frames_split_wedges() {
        let run = Run {
            range: 10.0,
            delta: 1.0,
            wedge: 180.0,
            existing: "1-3,6".to_string(),
            ..Run::default()
        };
        let wedges = make_wedges(&run);
        let covered: Vec<(u32, u32)> = wedges.iter().map(|w| (w.first, w.num_frames)).collect();
        assert_eq!(covered, vec![(4, 2), (7, 4)]);
        // Angles track the frame offsets, not the wedge index.
        assert!((wedges[0].start - 3.0).abs() < 1e-9);
        assert!((wedges[1].start - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_fully_collected_run_yields_no_wedges() {
        let run = Run {
            range: 5.0,
            delta: 1.0,
            existing: "1-5".to_string(),
            ..Run::default()
        };
        assert!(make_wedges(&run).is_empty());
    }

    #[test]
    fn test_scan_existing_reads_disk() {
        let dir = tempdir().expect("tempdir");
        for frame in [1u32, 2, 3, 7] {
            let file = dir.path().join(format!("xtal_{frame:04}.img"));
            std::fs::write(&file, b"frame").expect("write frame");
        }
        std::fs::write(dir.path().join("other_0001.img"), b"x").expect("write");
        std::fs::write(dir.path().join("xtal_0005.cbf"), b"x").expect("write");

        assert_eq!(scan_existing(dir.path(), "xtal", "img"), vec![1, 2, 3, 7]);
        assert_eq!(
            scan_existing(dir.path(), "missing", "img"),
            Vec::<u32>::new()
        );
        assert_eq!(
            scan_existing(Path::new("/no/such/dir"), "xtal", "img"),
            Vec::<u32>::new()
        );
    }

    #[test]
    fn test_summary_merge_preserves_identifier() {
        let dir = tempdir().expect("tempdir");
        let base = DatasetSummary {
            id: Some("lims-42".to_string()),
            name: "xtal".to_string(),
            directory: dir.path().to_path_buf(),
            frames: "1-5".to_string(),
            num_frames: 5,
            energy: 12.658,
            distance: 250.0,
            attenuation: 0.0,
            exposure: 0.5,
            start_angle: 0.0,
            delta: 1.0,
            beamline: "SIM-1".to_string(),
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
        };
        base.clone().save_merged().expect("first save");

        let resumed = DatasetSummary {
            id: None,
            frames: "6-10".to_string(),
            num_frames: 5,
            ..base.clone()
        };
        let merged = resumed.save_merged().expect("second save");
        assert_eq!(merged.id.as_deref(), Some("lims-42"));
        assert_eq!(merged.frames, "1-10");
        assert_eq!(merged.num_frames, 10);

        let loaded =
            DatasetSummary::load(&DatasetSummary::path(dir.path(), "xtal")).expect("load");
        assert_eq!(loaded, merged);
    }
}
