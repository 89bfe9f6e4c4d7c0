// Capture throttling
//
// Rendering runs as fast as the loop spins; copying pixels back to the host
// is the expensive part, so captures are limited to the configured rate.

use std::time::{Duration, Instant};

use crate::config::{delay_for_fps, CaptureConfig, CapturePolicy};
use crate::transform::Transform;

/// Minimum interval between captures
#[derive(Debug, Clone, Copy)]
pub struct CaptureThrottle {
    refresh_delay: Duration,
    last_capture: Option<Instant>,
}

impl CaptureThrottle {
    pub fn new(refresh_delay: Duration) -> Self {
        Self {
            refresh_delay,
            last_capture: None,
        }
    }

    pub fn from_fps(fps: f32) -> Self {
        Self::new(delay_for_fps(fps).unwrap_or(Duration::MAX))
    }

    pub fn refresh_delay(&self) -> Duration {
        self.refresh_delay
    }

    /// True when nothing was captured yet or the delay has fully elapsed
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_capture {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.refresh_delay,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last_capture = Some(now);
    }
}

/// Decides per tick whether the rendered frame is read back
pub struct FrameScheduler {
    throttle: CaptureThrottle,
    policy: CapturePolicy,
    last_captured: Option<Transform>,
    started: Instant,
    spin_radians_per_second: f32,
}

impl FrameScheduler {
    pub fn new(capture: &CaptureConfig, spin_degrees_per_second: f32, started: Instant) -> Self {
        Self {
            throttle: CaptureThrottle::new(capture.refresh_delay()),
            policy: capture.policy,
            last_captured: None,
            started,
            spin_radians_per_second: spin_degrees_per_second.to_radians(),
        }
    }

    pub fn should_capture(&self, now: Instant, transform: &Transform) -> bool {
        if !self.throttle.is_due(now) {
            return false;
        }
        match self.policy {
            CapturePolicy::Throttled => true,
            CapturePolicy::OnChange => self.last_captured.as_ref() != Some(transform),
        }
    }

    pub fn record_capture(&mut self, now: Instant, transform: Transform) {
        self.throttle.mark(now);
        self.last_captured = Some(transform);
    }

    /// Automatic rotation around Z at `now`
    pub fn spin_angle(&self, now: Instant) -> f32 {
        if self.spin_radians_per_second == 0.0 {
            return 0.0;
        }
        let elapsed = now.saturating_duration_since(self.started).as_secs_f32();
        (elapsed * self.spin_radians_per_second) % std::f32::consts::TAU
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(policy: CapturePolicy) -> CaptureConfig {
        CaptureConfig { fps: 60.0, policy }
    }

    #[test]
    fn vanishing_fps_never_comes_due_again() {
        let start = Instant::now();
        let mut throttle = CaptureThrottle::from_fps(1e-20);
        assert!(throttle.is_due(start));
        throttle.mark(start);
        assert!(!throttle.is_due(start + Duration::from_secs(3600)));
    }

    #[test]
    fn first_tick_is_always_due() {
        let throttle = CaptureThrottle::from_fps(60.0);
        assert!(throttle.is_due(Instant::now()));
    }

    #[test]
    fn ticks_5ms_apart_capture_once() {
        let start = Instant::now();
        let mut throttle = CaptureThrottle::from_fps(60.0);
        let mut captures = 0;
        for i in 0..3 {
            let now = start + Duration::from_millis(5 * i);
            if throttle.is_due(now) {
                throttle.mark(now);
                captures += 1;
            }
        }
        assert_eq!(captures, 1);
    }

    #[test]
    fn tick_after_refresh_delay_captures_again() {
        let start = Instant::now();
        let mut throttle = CaptureThrottle::from_fps(60.0);
        throttle.mark(start);
        assert!(!throttle.is_due(start + Duration::from_millis(16)));
        assert!(throttle.is_due(start + Duration::from_millis(17)));
    }

    #[test]
    fn on_change_skips_unchanged_transform() {
        let start = Instant::now();
        let mut scheduler = FrameScheduler::new(&config(CapturePolicy::OnChange), 0.0, start);
        let transform = Transform::default();

        assert!(scheduler.should_capture(start, &transform));
        scheduler.record_capture(start, transform);

        let later = start + Duration::from_millis(100);
        assert!(!scheduler.should_capture(later, &transform));

        let moved = Transform { rotate_x: 0.1, ..transform };
        assert!(scheduler.should_capture(later, &moved));
    }

    #[test]
    fn throttled_policy_ignores_transform() {
        let start = Instant::now();
        let mut scheduler = FrameScheduler::new(&config(CapturePolicy::Throttled), 0.0, start);
        let transform = Transform::default();
        scheduler.record_capture(start, transform);

        assert!(!scheduler.should_capture(start + Duration::from_millis(1), &transform));
        assert!(scheduler.should_capture(start + Duration::from_millis(20), &transform));
    }

    #[test]
    fn spin_is_zero_when_disabled() {
        let start = Instant::now();
        let scheduler = FrameScheduler::new(&config(CapturePolicy::Throttled), 0.0, start);
        assert_eq!(scheduler.spin_angle(start + Duration::from_secs(3)), 0.0);
    }

    #[test]
    fn spin_advances_with_time() {
        let start = Instant::now();
        let scheduler = FrameScheduler::new(&config(CapturePolicy::Throttled), 90.0, start);
        let angle = scheduler.spin_angle(start + Duration::from_secs(1));
        assert!((angle - std::f32::consts::FRAC_PI_2).abs() < 1e-4);
    }
}
