use std::collections::VecDeque;

use crate::UnixTime;

/// Sliding-window events-per-second counter.
///
/// Used for the `camera_fps` / `process_fps` / `detection_fps` /
/// `skipped_fps` family of metrics. The rate is computed over the last
/// `window_secs`, or since the first event when younger than that.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window_secs: f64,
    started: Option<UnixTime>,
    stamps: VecDeque<UnixTime>,
}

impl FpsCounter {
    pub fn new(window_secs: f64) -> FpsCounter {
        FpsCounter {
            window_secs,
            started: None,
            stamps: VecDeque::new(),
        }
    }

    pub fn update(&mut self, at: UnixTime) {
        if self.started.is_none() {
            self.started = Some(at);
        }
        self.stamps.push_back(at);
        self.expire(at);
    }

    pub fn eps(&mut self, now: UnixTime) -> f64 {
        self.expire(now);
        let Some(started) = self.started else {
            return 0.0;
        };
        let span = now.since(started).min(self.window_secs).max(1.0);
        self.stamps.len() as f64 / span
    }

    fn expire(&mut self, now: UnixTime) {
        let cutoff = now.offset(-self.window_secs);
        while self
            .stamps
            .front()
            .map(|s| *s < cutoff)
            .unwrap_or(false)
        {
            self.stamps.pop_front();
        }
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        FpsCounter::new(10.0)
    }
}
