//! Packet pacing.
//!
//! Departure deadlines are anchored to the first packet, so time spent
//! preparing and sending one packet is not added to the next gap.
//! Each wait sleeps for most of the gap and spins for the last
//! `spin_threshold`, which keeps departures within a fraction of a
//! millisecond of the recorded timing without spinning for whole gaps.

use std::time::Duration;

use quanta::Instant;

#[derive(Debug)]
pub struct Pacer {
    spin_threshold: Duration,
    origin: Option<(Instant, i64)>,
}

impl Pacer {
    pub fn new(spin_threshold: Duration) -> Self {
        Self {
            spin_threshold,
            origin: None,
        }
    }

    /// Block until the packet recorded at `ts_ms` is due.
    ///
    /// The first call returns at once and fixes the schedule. Timestamps
    /// earlier than the first are due immediately. Returns how late the
    /// caller was woken.
    pub fn wait_until_due(&mut self, ts_ms: i64) -> Duration {
        let (origin, origin_ts) = *self.origin.get_or_insert_with(|| (Instant::now(), ts_ms));
        let offset = u64::try_from(ts_ms - origin_ts).unwrap_or(0);
        let due = origin + Duration::from_millis(offset);

        let now = Instant::now();
        if now >= due {
            return now - due;
        }
        let remaining = due - now;
        if remaining > self.spin_threshold {
            std::thread::sleep(remaining - self.spin_threshold);
        }
        loop {
            let now = Instant::now();
            if now >= due {
                return now - due;
            }
            std::hint::spin_loop();
        }
    }

    /// When the first packet went out, if it has.
    pub fn origin(&self) -> Option<Instant> {
        self.origin.map(|(at, _)| at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_packet_is_immediate() {
        let mut pacer = Pacer::new(Duration::from_millis(1));
        let start = Instant::now();
        pacer.wait_until_due(5_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn gaps_follow_recorded_offsets() {
        let mut pacer = Pacer::new(Duration::from_millis(2));
        pacer.wait_until_due(1_000);
        let origin = pacer.origin().unwrap();
        pacer.wait_until_due(1_030);
        let first_gap = origin.elapsed();
        pacer.wait_until_due(1_050);
        let second = origin.elapsed();
        assert!(first_gap >= Duration::from_millis(30));
        assert!(second >= Duration::from_millis(50));
        assert!(second < Duration::from_millis(150));
    }

    #[test]
    fn out_of_order_timestamp_is_due_now() {
        let mut pacer = Pacer::new(Duration::ZERO);
        pacer.wait_until_due(100);
        let start = Instant::now();
        pacer.wait_until_due(40);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
