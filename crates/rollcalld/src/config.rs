use std::path::PathBuf;

use rollcall_core::LivenessConfig;

/// Service configuration, loaded from environment variables.
///
/// Every liveness threshold is exposed here so calibration never requires a
/// code change.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive identity match.
    pub match_threshold: f32,
    /// Flash-challenge thresholds.
    pub liveness: LivenessConfig,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let defaults = LivenessConfig::default();

        Self {
            db_path,
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", 0.55),
            liveness: LivenessConfig {
                frames_per_batch: env_usize(
                    "ROLLCALL_FRAMES_PER_BATCH",
                    defaults.frames_per_batch,
                ),
                min_brightness_delta_pct: env_f32(
                    "ROLLCALL_MIN_BRIGHTNESS_DELTA_PCT",
                    defaults.min_brightness_delta_pct,
                ),
                max_brightness_delta_pct: env_f32(
                    "ROLLCALL_MAX_BRIGHTNESS_DELTA_PCT",
                    defaults.max_brightness_delta_pct,
                ),
                min_color_variance: env_f32(
                    "ROLLCALL_MIN_COLOR_VARIANCE",
                    defaults.min_color_variance,
                ),
                max_edge_density: env_f32("ROLLCALL_MAX_EDGE_DENSITY", defaults.max_edge_density),
                edge_magnitude_threshold: env_f32(
                    "ROLLCALL_EDGE_MAGNITUDE_THRESHOLD",
                    defaults.edge_magnitude_threshold,
                ),
                min_luma_std: env_f32("ROLLCALL_MIN_LUMA_STD", defaults.min_luma_std),
                delta_std_target: env_f32("ROLLCALL_DELTA_STD_TARGET", defaults.delta_std_target),
                min_motion_delta: env_f32("ROLLCALL_MIN_MOTION_DELTA", defaults.min_motion_delta),
                max_motion_delta: env_f32("ROLLCALL_MAX_MOTION_DELTA", defaults.max_motion_delta),
                min_composite_score: env_f32(
                    "ROLLCALL_MIN_COMPOSITE_SCORE",
                    defaults.min_composite_score,
                ),
            },
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
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
