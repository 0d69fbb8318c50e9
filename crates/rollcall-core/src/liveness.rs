//! Flash-challenge liveness detection over before/after illumination frames.
//!
//! A live three-dimensional face reflects a brief screen flash non-uniformly:
//! curvature and shadow produce a moderate, uneven brightness response, and
//! involuntary micro-movements make the response vary from frame to frame. A
//! flat reproduction — printed photo, phone, tablet, monitor — responds almost
//! uniformly, carries pixel-grid edge artifacts, and exposes unnaturally flat
//! micro-texture.
//!
//! This module scores two ordered frame batches captured around a single
//! illumination pulse. It needs no depth sensor and no extra model: all six
//! metrics are computed from the center region of the frames themselves.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs, static screen replays, reflective flat
//!   reproductions held in front of the camera.
//! - **Does not block:** high-quality 3D masks, or displays whose brightness
//!   response has been tuned against the deployed thresholds. Thresholds are
//!   calibration constants, not ground truth — see [`LivenessConfig`].

use image::{GrayImage, RgbImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use serde::Serialize;
use thiserror::Error;

/// Input-contract violations. A spoof rejection is *not* an error — it is a
/// regular [`LivenessVerdict`] with `is_live = false` and a reason.
#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("empty {0} frame batch")]
    EmptyBatch(&'static str),
    #[error("frame batch shape {before}/{after} does not match protocol ({expected} per batch)")]
    BatchMismatch {
        before: usize,
        after: usize,
        expected: usize,
    },
    #[error("frame too small for center-region sampling: {width}x{height}")]
    DegenerateFrame { width: u32, height: u32 },
}

/// Tunable thresholds for the flash challenge.
///
/// Every constant here is a calibration concern: the shipped defaults are
/// starting points established against bench captures, and deployments are
/// expected to override them (see the `ROLLCALL_*` environment surface in the
/// service crate) after calibrating against representative live and spoof
/// samples.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Frames per batch on both sides of the pulse.
    pub frames_per_batch: usize,
    /// Lower bound of the plausible flash response, in percent of the
    /// before-batch baseline. Below this: no real response reached the
    /// subject (replay, or no pulse).
    pub min_brightness_delta_pct: f32,
    /// Upper bound of the plausible flash response. Above this: a reflective
    /// flat surface bounced the pulse straight back.
    pub max_brightness_delta_pct: f32,
    /// Floor on per-channel center-region pixel variance. Skin with natural
    /// shading sits well above it; flat prints sit below.
    pub min_color_variance: f32,
    /// Ceiling on the fraction of center pixels classified as edges.
    /// Display pixel grids push this far above any face.
    pub max_edge_density: f32,
    /// Sobel gradient magnitude above which a pixel counts as an edge.
    pub edge_magnitude_threshold: f32,
    /// Floor on center-region luminance standard deviation; depth and
    /// shading raise it versus a flat surface. Scored, not hard-failed.
    pub min_luma_std: f32,
    /// Per-pair brightness-delta standard deviation at which the
    /// nonuniformity score saturates. Screens show a near-constant jump
    /// across frames; live faces do not.
    pub delta_std_target: f32,
    /// Inter-frame motion below this reads as a static replay.
    pub min_motion_delta: f32,
    /// Inter-frame motion above this reads as gross movement or camera
    /// shake.
    pub max_motion_delta: f32,
    /// Minimum sum of the six per-metric scores for a live verdict.
    pub min_composite_score: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            frames_per_batch: 5,
            min_brightness_delta_pct: 2.0,
            max_brightness_delta_pct: 25.0,
            min_color_variance: 120.0,
            max_edge_density: 0.25,
            edge_magnitude_threshold: 800.0,
            min_luma_std: 10.0,
            delta_std_target: 1.5,
            min_motion_delta: 0.05,
            max_motion_delta: 20.0,
            min_composite_score: 3.5,
        }
    }
}

/// The six metrics behind a verdict, surfaced for logging and calibration.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessMetrics {
    pub before_brightness: f32,
    pub after_brightness: f32,
    /// Flash response as a percentage of the before-batch baseline.
    pub brightness_delta_pct: f32,
    /// Per-channel center-region variance, averaged over channels and
    /// before-frames.
    pub color_variance: f32,
    /// Fraction of center pixels above the gradient magnitude threshold,
    /// averaged over before-frames.
    pub edge_density: f32,
    /// Center-region luminance standard deviation ("uniformity").
    pub luma_std: f32,
    /// Standard deviation of the per-pair brightness delta across the batch
    /// ("nonuniformity").
    pub delta_std: f32,
    /// Mean absolute luminance difference between consecutive before-frames.
    pub motion_delta: f32,
    /// Sum of the per-metric scores; zero when a hard-fail check rejected
    /// the attempt before scoring.
    pub composite_score: f32,
}

/// Outcome of one flash challenge.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    pub metrics: LivenessMetrics,
    /// Specific, human-readable rejection reason. Always present when
    /// `is_live` is false, never when true.
    pub reason: Option<String>,
}

/// Analyzes before/after flash frame batches against a [`LivenessConfig`].
#[derive(Debug, Clone)]
pub struct FlashAnalyzer {
    config: LivenessConfig,
}

/// Per-frame center-region statistics.
struct FrameStats {
    mean_luma: f32,
    luma_std: f32,
    color_variance: f32,
    edge_density: f32,
    center_luma: GrayImage,
}

impl FlashAnalyzer {
    pub fn new(config: LivenessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Run the flash challenge over two ordered frame batches.
    ///
    /// Hard-fail checks run first, in order: edge density (screen pixel
    /// grid), color variance (flat surface), brightness delta envelope (no
    /// response / reflective surface). Each rejects immediately with a
    /// specific reason regardless of the other metrics. Only when all three
    /// pass are the six bounded per-metric scores summed against
    /// `min_composite_score`.
    pub fn analyze(
        &self,
        before: &[RgbImage],
        after: &[RgbImage],
    ) -> Result<LivenessVerdict, LivenessError> {
        let cfg = &self.config;

        if before.is_empty() {
            return Err(LivenessError::EmptyBatch("before"));
        }
        if after.is_empty() {
            return Err(LivenessError::EmptyBatch("after"));
        }
        if before.len() != after.len() || before.len() != cfg.frames_per_batch {
            return Err(LivenessError::BatchMismatch {
                before: before.len(),
                after: after.len(),
                expected: cfg.frames_per_batch,
            });
        }

        let before_stats = before
            .iter()
            .map(|f| self.frame_stats(f))
            .collect::<Result<Vec<_>, _>>()?;
        let after_stats = after
            .iter()
            .map(|f| self.frame_stats(f))
            .collect::<Result<Vec<_>, _>>()?;

        let before_brightness = mean(before_stats.iter().map(|s| s.mean_luma));
        let after_brightness = mean(after_stats.iter().map(|s| s.mean_luma));
        let brightness_delta_pct = if before_brightness > 0.0 {
            (after_brightness - before_brightness) / before_brightness * 100.0
        } else {
            0.0
        };

        let pair_deltas: Vec<f32> = before_stats
            .iter()
            .zip(after_stats.iter())
            .map(|(b, a)| a.mean_luma - b.mean_luma)
            .collect();

        let mut metrics = LivenessMetrics {
            before_brightness,
            after_brightness,
            brightness_delta_pct,
            color_variance: mean(before_stats.iter().map(|s| s.color_variance)),
            edge_density: mean(before_stats.iter().map(|s| s.edge_density)),
            luma_std: mean(before_stats.iter().map(|s| s.luma_std)),
            delta_std: std_dev(&pair_deltas),
            motion_delta: motion_delta(&before_stats),
            composite_score: 0.0,
        };

        // Hard fails: fast rejection of obvious spoofing or positioning
        // errors, independent of the composite score.
        if metrics.edge_density > cfg.max_edge_density {
            return Ok(rejected(
                metrics.clone(),
                format!(
                    "screen pixel pattern detected (edge density {:.3})",
                    metrics.edge_density
                ),
            ));
        }
        if metrics.color_variance < cfg.min_color_variance {
            return Ok(rejected(
                metrics.clone(),
                format!(
                    "flat low-texture surface (color variance {:.0})",
                    metrics.color_variance
                ),
            ));
        }
        if metrics.brightness_delta_pct < cfg.min_brightness_delta_pct {
            return Ok(rejected(
                metrics.clone(),
                format!(
                    "no flash response (brightness delta {:.1}%)",
                    metrics.brightness_delta_pct
                ),
            ));
        }
        if metrics.brightness_delta_pct > cfg.max_brightness_delta_pct {
            return Ok(rejected(
                metrics.clone(),
                format!(
                    "reflective surface response (brightness delta {:.1}%)",
                    metrics.brightness_delta_pct
                ),
            ));
        }

        metrics.composite_score = self.composite_score(&metrics);
        if metrics.composite_score < cfg.min_composite_score {
            let reason = format!(
                "weak liveness signal (score {:.2} below {:.2})",
                metrics.composite_score, cfg.min_composite_score
            );
            return Ok(rejected(metrics, reason));
        }

        Ok(LivenessVerdict {
            is_live: true,
            metrics,
            reason: None,
        })
    }

    /// Sum of the six bounded per-metric scores, each in [0, 1], higher =
    /// more face-like.
    fn composite_score(&self, m: &LivenessMetrics) -> f32 {
        let cfg = &self.config;

        // Brightness: peak at the center of the plausible envelope.
        let mid = (cfg.min_brightness_delta_pct + cfg.max_brightness_delta_pct) / 2.0;
        let half = (cfg.max_brightness_delta_pct - cfg.min_brightness_delta_pct) / 2.0;
        let brightness = clamp01(1.0 - (m.brightness_delta_pct - mid).abs() / half);

        // Variance and luma spread: 0 at the floor, saturating at twice it.
        let variance = clamp01((m.color_variance - cfg.min_color_variance) / cfg.min_color_variance);
        let uniformity = clamp01((m.luma_std - cfg.min_luma_std) / cfg.min_luma_std);

        // Edges: cleaner is better, 0 at the ceiling.
        let edges = clamp01((cfg.max_edge_density - m.edge_density) / cfg.max_edge_density);

        // Nonuniformity: a perfectly constant jump across frames is the
        // screen signature; saturate at the configured target.
        let nonuniformity = clamp01(m.delta_std / cfg.delta_std_target);

        let motion = band_score(m.motion_delta, cfg.min_motion_delta, cfg.max_motion_delta);

        brightness + variance + uniformity + edges + nonuniformity + motion
    }

    fn frame_stats(&self, frame: &RgbImage) -> Result<FrameStats, LivenessError> {
        let (w, h) = frame.dimensions();
        if w < 8 || h < 8 {
            return Err(LivenessError::DegenerateFrame {
                width: w,
                height: h,
            });
        }

        let (x0, y0) = (w / 4, h / 4);
        let (cw, ch) = (w / 2, h / 2);
        let n = (cw as f64) * (ch as f64);

        // Per-channel variance over the center region.
        let mut sum = [0f64; 3];
        let mut sum_sq = [0f64; 3];
        for y in y0..y0 + ch {
            for x in x0..x0 + cw {
                let px = frame.get_pixel(x, y);
                for c in 0..3 {
                    let v = px[c] as f64;
                    sum[c] += v;
                    sum_sq[c] += v * v;
                }
            }
        }
        let color_variance = (0..3)
            .map(|c| {
                let m = sum[c] / n;
                sum_sq[c] / n - m * m
            })
            .sum::<f64>() as f32
            / 3.0;

        let gray = image::imageops::grayscale(frame);
        let center_luma = image::imageops::crop_imm(&gray, x0, y0, cw, ch).to_image();

        let mut luma_sum = 0f64;
        let mut luma_sq = 0f64;
        for px in center_luma.pixels() {
            let v = px[0] as f64;
            luma_sum += v;
            luma_sq += v * v;
        }
        let mean_luma = luma_sum / n;
        let luma_var = (luma_sq / n - mean_luma * mean_luma).max(0.0);

        let gx = horizontal_sobel(&center_luma);
        let gy = vertical_sobel(&center_luma);
        let threshold_sq = (self.config.edge_magnitude_threshold as f64).powi(2);
        let edge_pixels = gx
            .pixels()
            .zip(gy.pixels())
            .filter(|(px, py)| {
                let gx = px[0] as f64;
                let gy = py[0] as f64;
                gx * gx + gy * gy > threshold_sq
            })
            .count();

        Ok(FrameStats {
            mean_luma: mean_luma as f32,
            luma_std: luma_var.sqrt() as f32,
            color_variance,
            edge_density: edge_pixels as f32 / n as f32,
            center_luma,
        })
    }
}

fn rejected(metrics: LivenessMetrics, reason: String) -> LivenessVerdict {
    LivenessVerdict {
        is_live: false,
        metrics,
        reason: Some(reason),
    }
}

fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

/// Trapezoid score over [lo, hi]: ramps up below `lo`, holds 1.0 through the
/// band, tapers to 0 over the top quarter, 0 beyond `hi`.
fn band_score(value: f32, lo: f32, hi: f32) -> f32 {
    if value <= 0.0 || value > hi {
        return 0.0;
    }
    if value < lo {
        return clamp01(value / lo);
    }
    let taper_start = hi * 0.75;
    if value > taper_start {
        clamp01((hi - value) / (hi - taper_start))
    } else {
        1.0
    }
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0f64, 0usize), |(s, c), v| (s + v as f64, c + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    }
}

fn std_dev(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    var.sqrt() as f32
}

/// Mean absolute luminance difference between consecutive before-frames.
fn motion_delta(stats: &[FrameStats]) -> f32 {
    if stats.len() < 2 {
        return 0.0;
    }
    let mut diffs = Vec::with_capacity(stats.len() - 1);
    for pair in stats.windows(2) {
        let a = &pair[0].center_luma;
        let b = &pair[1].center_luma;
        let total: f64 = a
            .pixels()
            .zip(b.pixels())
            .map(|(pa, pb)| (pa[0] as f64 - pb[0] as f64).abs())
            .sum();
        diffs.push((total / (a.width() as f64 * a.height() as f64)) as f32);
    }
    mean(diffs.into_iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// 64x64 frame split into two flat vertical halves; equal RGB channels
    /// keep the luma math exact.
    fn split_frame(left: u8, right: u8) -> RgbImage {
        RgbImage::from_fn(64, 64, |x, _| {
            let v = if x < 32 { left } else { right };
            Rgb([v, v, v])
        })
    }

    /// 2-pixel vertical stripes at full contrast — a display pixel grid.
    fn stripe_frame() -> RgbImage {
        RgbImage::from_fn(64, 64, |x, _| {
            let v = if (x / 2) % 2 == 0 { 0 } else { 255 };
            Rgb([v, v, v])
        })
    }

    fn flat_frame(v: u8) -> RgbImage {
        RgbImage::from_pixel(64, 64, Rgb([v, v, v]))
    }

    /// A plausible live capture: dim textured before-frames with slight
    /// inter-frame motion, after-frames brighter by ~10% with per-pair
    /// variation in the jump.
    fn live_batches() -> (Vec<RgbImage>, Vec<RgbImage>) {
        let jitter: [i16; 5] = [-1, 0, 1, 0, -1];
        let before: Vec<_> = (0..5u8).map(|i| split_frame(80 + i, 140 + i)).collect();
        let after: Vec<_> = (0..5usize)
            .map(|i| {
                let bump = 12 + jitter[i];
                split_frame(
                    (80 + i as i16 + bump) as u8,
                    (140 + i as i16 + bump) as u8,
                )
            })
            .collect();
        (before, after)
    }

    fn analyzer() -> FlashAnalyzer {
        FlashAnalyzer::new(LivenessConfig::default())
    }

    #[test]
    fn live_capture_passes() {
        let (before, after) = live_batches();
        let verdict = analyzer().analyze(&before, &after).unwrap();
        assert!(verdict.is_live, "metrics: {:?}", verdict.metrics);
        assert!(verdict.reason.is_none());
        assert!(verdict.metrics.brightness_delta_pct > 2.0);
        assert!(verdict.metrics.brightness_delta_pct < 25.0);
        assert!(verdict.metrics.composite_score >= 3.5);
    }

    #[test]
    fn screen_pattern_hard_fails() {
        // Static printed/displayed reproduction: identical batches, dense
        // pixel-grid edges. Must reject on the edge check even though the
        // brightness delta is also implausible.
        let before = vec![stripe_frame(); 5];
        let after = vec![stripe_frame(); 5];
        let verdict = analyzer().analyze(&before, &after).unwrap();
        assert!(!verdict.is_live);
        let reason = verdict.reason.unwrap();
        assert!(reason.contains("screen"), "reason: {reason}");
        assert!(verdict.metrics.edge_density > 0.25);
    }

    #[test]
    fn flat_surface_hard_fails() {
        let before = vec![flat_frame(128); 5];
        let after = vec![flat_frame(140); 5];
        let verdict = analyzer().analyze(&before, &after).unwrap();
        assert!(!verdict.is_live);
        assert!(verdict.reason.unwrap().contains("flat"));
    }

    #[test]
    fn missing_flash_response_hard_fails() {
        let (before, _) = live_batches();
        let after = before.clone();
        let verdict = analyzer().analyze(&before, &after).unwrap();
        assert!(!verdict.is_live);
        assert!(verdict.reason.unwrap().contains("no flash response"));
    }

    #[test]
    fn reflective_surface_hard_fails() {
        let before = vec![split_frame(80, 140); 5];
        // +50% jump — a glossy surface bounced the pulse straight back.
        let after = vec![split_frame(120, 210); 5];
        let verdict = analyzer().analyze(&before, &after).unwrap();
        assert!(!verdict.is_live);
        assert!(verdict.reason.unwrap().contains("reflective"));
    }

    #[test]
    fn static_uniform_response_fails_composite() {
        // Passes every hard check (texture just above the variance floor,
        // delta mid-envelope) but is frozen: zero motion, perfectly constant
        // per-pair jump. The composite score must reject it.
        let before = vec![split_frame(100, 122); 5];
        let after = vec![split_frame(115, 137); 5];
        let verdict = analyzer().analyze(&before, &after).unwrap();
        assert!(!verdict.is_live);
        let reason = verdict.reason.unwrap();
        assert!(reason.contains("weak liveness signal"), "reason: {reason}");
        assert!(verdict.metrics.motion_delta < 0.01);
        assert!(verdict.metrics.delta_std < 0.01);
        assert!(verdict.metrics.composite_score < 3.5);
    }

    #[test]
    fn composite_threshold_is_tunable() {
        let (before, after) = live_batches();

        let strict = FlashAnalyzer::new(LivenessConfig {
            min_composite_score: 6.0,
            ..LivenessConfig::default()
        });
        assert!(!strict.analyze(&before, &after).unwrap().is_live);

        // The frozen capture from the composite test passes under a
        // permissive threshold — hard checks alone do not reject it.
        let lax = FlashAnalyzer::new(LivenessConfig {
            min_composite_score: 1.0,
            ..LivenessConfig::default()
        });
        let frozen_before = vec![split_frame(100, 122); 5];
        let frozen_after = vec![split_frame(115, 137); 5];
        assert!(lax.analyze(&frozen_before, &frozen_after).unwrap().is_live);
    }

    #[test]
    fn empty_batch_is_input_error() {
        let (before, after) = live_batches();
        assert!(matches!(
            analyzer().analyze(&[], &after),
            Err(LivenessError::EmptyBatch("before"))
        ));
        assert!(matches!(
            analyzer().analyze(&before, &[]),
            Err(LivenessError::EmptyBatch("after"))
        ));
    }

    #[test]
    fn batch_length_mismatch_is_input_error() {
        let (before, after) = live_batches();
        let err = analyzer().analyze(&before[..4], &after).unwrap_err();
        assert!(matches!(err, LivenessError::BatchMismatch { before: 4, after: 5, expected: 5 }));

        // Equal but off-protocol counts are also a contract violation.
        let err = analyzer().analyze(&before[..3], &after[..3]).unwrap_err();
        assert!(matches!(err, LivenessError::BatchMismatch { before: 3, after: 3, expected: 5 }));
    }

    #[test]
    fn degenerate_frame_is_input_error() {
        let tiny = vec![RgbImage::from_pixel(4, 4, Rgb([100, 100, 100])); 5];
        let err = analyzer().analyze(&tiny, &tiny).unwrap_err();
        assert!(matches!(err, LivenessError::DegenerateFrame { width: 4, height: 4 }));
    }

    #[test]
    fn band_score_shape() {
        assert_eq!(band_score(0.0, 0.05, 20.0), 0.0);
        assert_eq!(band_score(1.0, 0.05, 20.0), 1.0);
        assert_eq!(band_score(25.0, 0.05, 20.0), 0.0);
        let tapered = band_score(17.5, 0.05, 20.0);
        assert!(tapered > 0.0 && tapered < 1.0);
    }
}
