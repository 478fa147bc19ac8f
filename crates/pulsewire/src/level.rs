//! Noise floor tracking

#[cfg(not(test))]
use log::warn;

#[cfg(test)]
use std::println as warn;

/// Margin between the noise floor and a "signal" frame (dB)
pub const NOISE_MARGIN_DB: f32 = 3.0;

/// Outcome of one frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameVerdict {
    /// True if the frame should be sliced for pulses
    pub process: bool,
    /// True if the frame is no louder than the noise floor
    pub noise_only: bool,
    /// Noise floor after this frame (dB)
    pub noise_db: f32,
    /// New minimum detection level (dB), if it changed
    pub min_level_db: Option<f32>,
}

/// Noise floor estimator and squelch
///
/// The floor follows the mean level of each frame with an
/// asymmetric IIR filter. Quiet frames pull it down within
/// about eight frames:
///
/// ```txt
/// noise = (7·noise + avg_db) / 8
/// ```
///
/// and louder frames push it up over about 32:
///
/// ```txt
/// noise = (31·noise + avg_db) / 32
/// ```
///
/// A frame is *noise only* if its mean is less than 3 dB
/// above the floor.
///
/// With auto-level enabled, a floor which settles more than
/// 3 dB below the configured minimum level drags the minimum
/// detection level down to `noise + 3 dB`. The level never
/// rises above the configured minimum.
#[derive(Clone, Debug)]
pub struct LevelTracker {
    min_level_db: f32,
    min_level_auto_db: f32,
    noise_db: f32,
    auto_level: bool,
    squelch: bool,
    analyze: bool,
    frames: u64,
    squelched: u64,
}

impl LevelTracker {
    /// New tracker with the configured minimum level (dB)
    pub fn new(min_level_db: f32) -> Self {
        Self {
            min_level_db,
            min_level_auto_db: min_level_db,
            noise_db: min_level_db - NOISE_MARGIN_DB,
            auto_level: false,
            squelch: false,
            analyze: false,
            frames: 0,
            squelched: 0,
        }
    }

    /// Follow the noise floor with the detection level
    pub fn with_auto_level(mut self, on: bool) -> Self {
        self.auto_level = on;
        self
    }

    /// Skip noise-only frames
    pub fn with_squelch(mut self, on: bool) -> Self {
        self.squelch = on;
        self
    }

    /// Process every frame, squelch or not
    pub fn with_analyze(mut self, on: bool) -> Self {
        self.analyze = on;
        self
    }

    /// Account for one frame with mean level `avg_db`
    pub fn update(&mut self, avg_db: f32) -> FrameVerdict {
        self.frames += 1;

        let noise_only = avg_db < self.noise_db + NOISE_MARGIN_DB;
        let process = !self.squelch || !noise_only || self.analyze;
        let mut min_level_db = None;

        if noise_only {
            self.squelched += 1;
            self.noise_db = (self.noise_db * 7.0 + avg_db) / 8.0;

            if self.auto_level
                && self.noise_db < self.min_level_db - NOISE_MARGIN_DB
                && (self.min_level_auto_db - self.noise_db - NOISE_MARGIN_DB).abs() > 1.0
            {
                self.min_level_auto_db = self.noise_db + NOISE_MARGIN_DB;
                warn!(
                    "auto level: estimated noise level is {:.1} dB, adjusting minimum detection level to {:.1} dB",
                    self.noise_db, self.min_level_auto_db
                );
                min_level_db = Some(self.min_level_auto_db);
            }
        } else {
            self.noise_db = (self.noise_db * 31.0 + avg_db) / 32.0;
        }

        FrameVerdict {
            process,
            noise_only,
            noise_db: self.noise_db,
            min_level_db,
        }
    }

    /// Minimum detection level in effect (dB)
    pub fn min_level_db(&self) -> f32 {
        self.min_level_auto_db
    }

    /// Current noise floor estimate (dB)
    pub fn noise_db(&self) -> f32 {
        self.noise_db
    }

    /// Frames seen, and frames which were noise only
    pub fn frame_counts(&self) -> (u64, u64) {
        (self.frames, self.squelched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_noise_tracking() {
        let mut lt = LevelTracker::new(-12.0);
        assert_approx_eq!(lt.noise_db(), -15.0f32);

        // quiet frames: fast fall, no level change without auto-level
        let v = lt.update(-31.0);
        assert!(v.noise_only);
        assert!(v.process);
        assert_approx_eq!(v.noise_db, -17.0f32);
        assert_eq!(v.min_level_db, None);

        // a loud frame: slow rise
        let v = lt.update(15.0);
        assert!(!v.noise_only);
        assert_approx_eq!(v.noise_db, -16.0f32);
        assert_approx_eq!(lt.min_level_db(), -12.0f32);
        assert_eq!(lt.frame_counts(), (2, 1));
    }

    #[test]
    fn test_auto_level() {
        let mut lt = LevelTracker::new(-12.0).with_auto_level(true);
        let v = lt.update(-40.0);
        assert_approx_eq!(v.noise_db, -18.125f32);
        assert_approx_eq!(v.min_level_db.unwrap(), -15.125f32);

        for _ in 0..200 {
            lt.update(-40.0);
        }
        // settles within a dB of noise + 3
        assert!((lt.min_level_db() - -37.0).abs() <= 1.0);

        // never above the configured minimum
        for _ in 0..500 {
            lt.update(-5.0);
        }
        assert!(lt.min_level_db() <= -12.0);
    }

    #[test]
    fn test_squelch() {
        let mut lt = LevelTracker::new(-12.0).with_squelch(true);
        assert!(!lt.update(-30.0).process);
        assert!(lt.update(0.0).process);

        let mut lt = LevelTracker::new(-12.0)
            .with_squelch(true)
            .with_analyze(true);
        assert!(lt.update(-30.0).process);
    }
}
