//! Frame advantage tracking and frame delay recommendations.
//!
//! Each side keeps a window of recent local and remote advantages. When the
//! local side runs consistently ahead, it is told to wait a few frames.

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Frame;

const DEFAULT_FRAME_WINDOW_SIZE: usize = 40;
const DEFAULT_MIN_FRAME_ADVANTAGE: i32 = 3;
const DEFAULT_MAX_FRAME_ADVANTAGE: i32 = 9;

/// Tuning for the frame-delay recommendation.
///
/// Each connection records its own and its peer's frame advantage for every
/// frame it sends. The recommendation compares the averages over the last
/// `window_size` frames.
///
/// ```
/// use rollback_netplay::TimeSyncConfig;
///
/// let smooth = TimeSyncConfig {
///     window_size: 60,
///     ..TimeSyncConfig::default()
/// };
/// assert_eq!(smooth.max_frame_advantage, 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncConfig {
    /// Number of frames averaged. Larger windows react slower but jitter less.
    pub window_size: usize,
    /// Recommendations smaller than this are rounded down to zero.
    pub min_frame_advantage: i32,
    /// Upper bound for a single recommendation.
    pub max_frame_advantage: i32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_FRAME_WINDOW_SIZE,
            min_frame_advantage: DEFAULT_MIN_FRAME_ADVANTAGE,
            max_frame_advantage: DEFAULT_MAX_FRAME_ADVANTAGE,
        }
    }
}

impl TimeSyncConfig {
    /// A shorter window for stable local networks.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            window_size: 10,
            ..Self::default()
        }
    }
}

/// Rolling window of local and remote frame advantages for one connection.
#[derive(Debug)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
    config: TimeSyncConfig,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    /// Creates a window with the given configuration.
    #[must_use]
    pub fn with_config(mut config: TimeSyncConfig) -> Self {
        config.window_size = config.window_size.max(1);
        Self {
            local: vec![0; config.window_size],
            remote: vec![0; config.window_size],
            config,
        }
    }

    /// Records the advantages observed when `frame` was sent.
    pub fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        if !frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "TimeSync::advance_frame called with invalid frame {}, skipping update",
                frame
            );
            return;
        }
        let slot = frame.as_i32() as usize % self.config.window_size;
        self.local[slot] = local_adv;
        self.remote[slot] = remote_adv;
    }

    fn averages(&self) -> (f32, f32) {
        let local_sum: i32 = self.local.iter().sum();
        let remote_sum: i32 = self.remote.iter().sum();
        let len = self.config.window_size as f32;
        (local_sum as f32 / len, remote_sum as f32 / len)
    }

    /// Half the difference between the remote and local averages.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        let (local_avg, remote_avg) = self.averages();
        ((remote_avg - local_avg) / 2.0) as i32
    }

    /// How many frames this peer should wait so the other side can catch up.
    ///
    /// Only the peer that both sides agree is ahead gets a non-zero answer.
    #[must_use]
    pub fn recommended_frame_delay(&self) -> i32 {
        let (local_avg, remote_avg) = self.averages();
        if local_avg >= remote_avg {
            return 0;
        }
        let sleep_frames = ((remote_avg - local_avg) / 2.0).round() as i32;
        if sleep_frames < self.config.min_frame_advantage {
            return 0;
        }
        sleep_frames.min(self.config.max_frame_advantage)
    }
}
