//! Input quality index from rolling percentile windows.
//!
//! Typing speed and best curve score are each ranked against a sliding window
//! of recent observations; the blend of both ranks tells the orchestrator how
//! far to trust curve evidence over the language model.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::settings::QualitySettings;

const MAGIC: &[u8; 4] = b"GLQH";
const VERSION: u8 = 2;

/// Cut points are only meaningful from this many samples on.
pub const MIN_SAMPLES: usize = 10;

#[derive(Clone, Debug)]
pub struct RollingPercentile {
    samples: VecDeque<f64>,
    capacity: usize,
    percentile: f64,
    min_ratio: f64,
    low: f64,
    high: f64,
    calibrated: bool,
}

impl RollingPercentile {
    pub fn new(capacity: usize, percentile: f64, min_ratio: f64) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            percentile,
            min_ratio,
            low: 0.0,
            high: 0.0,
            calibrated: false,
        }
    }

    pub fn from_settings(s: &QualitySettings) -> Self {
        Self::new(s.window, s.percentile, s.min_ratio)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.low, self.high)
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.samples.push_back(value);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Rank `value` in [0, 1] against the current cut points.
    ///
    /// Returns 0.5 while the window cannot separate low from high values.
    pub fn normalize(&mut self, value: f64) -> f64 {
        if !self.calibrated {
            self.recompute();
        }
        if self.high <= self.low || !value.is_finite() {
            return 0.5;
        }
        ((value - self.low) / (self.high - self.low)).clamp(0.0, 1.0)
    }

    pub fn recompute(&mut self) {
        let n = self.samples.len();
        if n < MIN_SAMPLES {
            self.low = 0.0;
            self.high = 0.0;
            self.calibrated = false;
            return;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let last = (n - 1) as f64;
        self.low = sorted[(last * self.percentile).round() as usize];
        self.high = sorted[(last * (1.0 - self.percentile)).round() as usize];
        if self.min_ratio > 0.0 {
            self.low = self.low.max(self.high * self.min_ratio);
        }
        self.calibrated = true;
    }

    fn samples(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }

    fn load_samples(&mut self, samples: Vec<f64>) {
        self.samples.clear();
        for v in samples {
            self.push(v);
        }
        self.recompute();
    }
}

#[derive(Serialize, Deserialize)]
struct HistogramData {
    speed: Vec<f64>,
    curve: Vec<f64>,
}

/// Speed and curve-score windows, persisted across sessions.
pub struct QualityHistograms {
    speed: RollingPercentile,
    curve: RollingPercentile,
    path: Option<PathBuf>,
    loaded: bool,
    dirty: bool,
}

impl QualityHistograms {
    pub fn new(settings: &QualitySettings, path: Option<PathBuf>) -> Self {
        Self {
            speed: RollingPercentile::from_settings(settings),
            curve: RollingPercentile::from_settings(settings),
            path,
            loaded: false,
            dirty: false,
        }
    }

    /// Quality index in [0, 1]: fast typing lowers it, a strong best curve
    /// score raises it. The samples are recorded after ranking.
    pub fn quality_index(&mut self, speed: Option<f64>, max_curve: f64) -> f64 {
        self.ensure_loaded();
        let speed_rank = speed.map_or(0.5, |v| self.speed.normalize(v));
        let curve_rank = self.curve.normalize(max_curve);
        if let Some(v) = speed {
            self.speed.push(v);
        }
        self.curve.push(max_curve);
        self.dirty = true;
        ((1.0 - speed_rank) + curve_rank) / 2.0
    }

    pub fn recompute(&mut self) {
        self.speed.recompute();
        self.curve.recompute();
    }

    pub fn speed(&self) -> &RollingPercentile {
        &self.speed
    }

    pub fn curve(&self) -> &RollingPercentile {
        &self.curve
    }

    /// Write the windows if they changed since the last save.
    /// Returns `true` if a file was written.
    pub fn save_if_dirty(&mut self) -> Result<bool, io::Error> {
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }
        self.save(&path)?;
        self.dirty = false;
        Ok(true)
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;
        let Some(path) = self.path.clone() else {
            return;
        };
        match Self::read(&path) {
            Ok(Some(data)) => {
                debug!(
                    speed = data.speed.len(),
                    curve = data.curve.len(),
                    "loaded quality histograms"
                );
                self.speed.load_samples(data.speed);
                self.curve.load_samples(data.curve);
            }
            Ok(None) => {}
            Err(e) => warn!("discarding quality histograms at {}: {e}", path.display()),
        }
    }

    /// `Ok(None)` for a missing file or a file from another format version.
    fn read(path: &Path) -> Result<Option<HistogramData>, io::Error> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if bytes.len() < 9 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "too short"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        if bytes[4] != VERSION {
            debug!(version = bytes[4], "stale quality histogram version");
            return Ok(None);
        }
        let expected_crc = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let payload = &bytes[9..];
        if crc32fast::hash(payload) != expected_crc {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "checksum mismatch"));
        }
        let data = bincode::deserialize(payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(data))
    }

    /// Atomic write: write to .tmp then rename.
    fn save(&self, path: &Path) -> Result<(), io::Error> {
        let data = HistogramData {
            speed: self.speed.samples(),
            curve: self.curve.samples(),
        };
        let payload = bincode::serialize(&data).map_err(io::Error::other)?;
        let mut buf = Vec::with_capacity(9 + payload.len());
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);

        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> RollingPercentile {
        RollingPercentile::new(500, 0.05, 0.0)
    }

    #[test]
    fn neutral_until_enough_samples() {
        let mut n = window();
        for i in 0..(MIN_SAMPLES - 1) {
            n.push(i as f64);
            assert_eq!(n.normalize(3.0), 0.5);
        }
    }

    #[test]
    fn ranks_within_bounds() {
        let mut n = window();
        for i in 0..=100 {
            n.push(i as f64);
        }
        n.recompute();
        let (low, high) = n.bounds();
        assert_eq!(low, 5.0);
        assert_eq!(high, 95.0);
        assert_eq!(n.normalize(0.0), 0.0);
        assert_eq!(n.normalize(200.0), 1.0);
        assert!((n.normalize(50.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn constant_samples_are_degenerate_not_nan() {
        let mut n = window();
        for _ in 0..20 {
            n.push(0.7);
        }
        let r = n.normalize(0.7);
        assert!(r.is_finite());
        assert!((0.0..=1.0).contains(&r));
        assert_eq!(r, 0.5);
        n.recompute();
        assert_eq!(n.normalize(0.7), 0.5);
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut n = RollingPercentile::new(10, 0.0, 0.0);
        for i in 0..25 {
            n.push(i as f64);
        }
        assert_eq!(n.len(), 10);
        n.recompute();
        assert_eq!(n.bounds(), (15.0, 24.0));
    }

    #[test]
    fn min_ratio_clamps_low() {
        let mut n = RollingPercentile::new(100, 0.0, 0.5);
        for i in 1..=20 {
            n.push(i as f64);
        }
        n.recompute();
        assert_eq!(n.bounds(), (10.0, 20.0));
    }

    #[test]
    fn non_finite_ignored() {
        let mut n = window();
        n.push(f64::NAN);
        n.push(f64::INFINITY);
        assert!(n.is_empty());
    }

    #[test]
    fn quality_index_blends_speed_and_curve() {
        let mut q = QualityHistograms::new(&crate::settings::Settings::default().quality, None);
        for i in 0..50 {
            q.quality_index(Some(i as f64), i as f64 / 50.0);
        }
        q.recompute();
        let careful = q.quality_index(Some(0.0), 1.0);
        let sloppy = q.quality_index(Some(100.0), 0.0);
        assert!(careful > 0.9, "careful = {careful}");
        assert!(sloppy < 0.1, "sloppy = {sloppy}");
        let unknown_speed = q.quality_index(None, 1.0);
        assert!((unknown_speed - 0.75).abs() < 1e-9);
    }

    #[test]
    fn persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.bin");
        let settings = crate::settings::Settings::default().quality;

        let mut q = QualityHistograms::new(&settings, Some(path.clone()));
        for i in 0..30 {
            q.quality_index(Some(i as f64), 0.5);
        }
        assert!(q.save_if_dirty().unwrap());
        assert!(!q.save_if_dirty().unwrap());

        let mut q2 = QualityHistograms::new(&settings, Some(path));
        q2.quality_index(None, 0.5);
        assert_eq!(q2.speed().len(), 30);
        assert_eq!(q2.curve().len(), 31);
    }

    #[test]
    fn stale_version_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.bin");
        let mut bytes = MAGIC.to_vec();
        bytes.push(VERSION - 1);
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&path, bytes).unwrap();

        let settings = crate::settings::Settings::default().quality;
        let mut q = QualityHistograms::new(&settings, Some(path));
        q.quality_index(Some(1.0), 0.5);
        assert_eq!(q.speed().len(), 1);
    }

    #[test]
    fn corrupt_file_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.bin");
        let mut bytes = MAGIC.to_vec();
        bytes.push(VERSION);
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        fs::write(&path, bytes).unwrap();

        let settings = crate::settings::Settings::default().quality;
        let mut q = QualityHistograms::new(&settings, Some(path));
        q.quality_index(Some(1.0), 0.5);
        assert_eq!(q.speed().len(), 1);
    }
}
