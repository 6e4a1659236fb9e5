#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Wall-clock milliseconds that never repeat or go backwards within one instance.
#[derive(Debug, Default)]
pub struct MonotonicClock {
	last: AtomicI64,
}

impl MonotonicClock {
	pub fn new() -> Self {
		Self::default()
	}

	/// Start after `floor`, e.g. the newest timestamp already persisted.
	pub fn starting_after(floor: i64) -> Self {
		Self {
			last: AtomicI64::new(floor),
		}
	}

	/// `max(now, last + 1)`.
	pub fn next_ms(&self) -> i64 {
		let now = unix_ms_now();
		let mut prev = self.last.load(Ordering::Relaxed);
		loop {
			let next = now.max(prev.saturating_add(1));
			match self.last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
				Ok(_) => return next,
				Err(actual) => prev = actual,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strictly_increasing_within_a_millisecond() {
		let clock = MonotonicClock::new();
		let mut prev = clock.next_ms();
		for _ in 0..1000 {
			let next = clock.next_ms();
			assert!(next > prev, "{next} <= {prev}");
			prev = next;
		}
	}

	#[test]
	fn respects_floor_in_the_future() {
		let floor = unix_ms_now() + 60_000;
		let clock = MonotonicClock::starting_after(floor);
		assert_eq!(clock.next_ms(), floor + 1);
	}
}
