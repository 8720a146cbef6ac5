use std::time::{Duration, Instant};

use parking_lot::Mutex;


/// Exponentially decayed throughput estimate for one direction of one channel (bytes/sec and
///  packets/sec).
///
/// Each sample adds `amount / tau` to the current estimate after decaying it by
///  `exp(-elapsed / tau)`, so a constant stream of `r` units per second converges to `r`, and
///  the estimate falls off smoothly once traffic stops.
///
/// Every metric has its own lock so that unrelated connections and directions never contend.
pub struct RateMetric {
    tau_secs: f64,
    state: Mutex<RateState>,
}

#[derive(Clone, Copy, Debug)]
struct RateState {
    bytes_per_sec: f64,
    packets_per_sec: f64,
    last_update: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSnapshot {
    pub bytes_per_sec: f64,
    pub packets_per_sec: f64,
}

impl RateMetric {
    pub const DEFAULT_TAU: Duration = Duration::from_secs(1);

    pub fn new(tau: Duration) -> RateMetric {
        Self::new_at(tau, Instant::now())
    }

    pub fn new_at(tau: Duration, now: Instant) -> RateMetric {
        assert!(!tau.is_zero());
        RateMetric {
            tau_secs: tau.as_secs_f64(),
            state: Mutex::new(RateState {
                bytes_per_sec: 0.0,
                packets_per_sec: 0.0,
                last_update: now,
            }),
        }
    }

    pub fn add(&self, bytes: usize, packets: usize) {
        self.add_at(Instant::now(), bytes, packets)
    }

    pub fn add_at(&self, now: Instant, bytes: usize, packets: usize) {
        let mut state = self.state.lock();
        self.decay(&mut state, now);
        state.bytes_per_sec += bytes as f64 / self.tau_secs;
        state.packets_per_sec += packets as f64 / self.tau_secs;
    }

    pub fn rate(&self) -> RateSnapshot {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&self, now: Instant) -> RateSnapshot {
        let mut state = self.state.lock();
        self.decay(&mut state, now);
        RateSnapshot {
            bytes_per_sec: state.bytes_per_sec,
            packets_per_sec: state.packets_per_sec,
        }
    }

    fn decay(&self, state: &mut RateState, now: Instant) {
        // Instant is monotonic per thread, but samples may race in from several threads
        let Some(elapsed) = now.checked_duration_since(state.last_update) else {
            return;
        };
        let factor = (-elapsed.as_secs_f64() / self.tau_secs).exp();
        state.bytes_per_sec *= factor;
        state.packets_per_sec *= factor;
        state.last_update = now;
    }
}
