use std::path::PathBuf;
use std::time::Duration;
use tatami_core::{EuclideanMatcher, MatchError};

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    pub bus: BusKind,
    /// V4L2 device path, or a directory of still images (default: /dev/video0).
    pub camera_device: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Detector command line; the first word is the program.
    pub detector_cmd: String,
    /// Maximum descriptor distance for a match.
    pub match_threshold: f32,
    pub poll_interval_ms: u64,
    /// Upper bound on one capture + detection round trip.
    pub detect_timeout_ms: u64,
    /// Frames thrown away after opening the camera while exposure settles.
    pub warmup_frames: usize,
}

impl Config {
    /// Load configuration from `TATAMI_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("tatami");

        let bus = match std::env::var("TATAMI_BUS").as_deref() {
            Ok("session") => BusKind::Session,
            _ => BusKind::System,
        };

        Self {
            bus,
            camera_device: std::env::var("TATAMI_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            db_path: std::env::var("TATAMI_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("tatami.db")),
            detector_cmd: std::env::var("TATAMI_DETECTOR_CMD")
                .unwrap_or_else(|_| "tatami-detector".to_string()),
            match_threshold: env_f32("TATAMI_MATCH_THRESHOLD", tatami_core::DEFAULT_MATCH_THRESHOLD),
            poll_interval_ms: env_u64("TATAMI_POLL_INTERVAL_MS", 500),
            detect_timeout_ms: env_u64("TATAMI_DETECT_TIMEOUT_MS", 2000),
            warmup_frames: env_usize("TATAMI_WARMUP_FRAMES", 4),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms.max(1))
    }

    /// The matcher for the configured threshold. Zero, negative or NaN thresholds are rejected.
    pub fn matcher(&self) -> Result<EuclideanMatcher, MatchError> {
        EuclideanMatcher::new(self.match_threshold)
    }

    /// Split the detector command into program and arguments.
    pub fn detector_command(&self) -> Option<(String, Vec<String>)> {
        split_command(&self.detector_cmd)
    }
}

fn split_command(cmd: &str) -> Option<(String, Vec<String>)> {
    let mut words = cmd.split_whitespace().map(str::to_string);
    let program = words.next()?;
    Some((program, words.collect()))
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
