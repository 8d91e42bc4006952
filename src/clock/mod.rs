/*!
# Device clock correction

Each device records with a free-running clock which drifts against the
reference clock. While recording, the device compares its clock against
the reference a few times per packet (the synchronization exchanges). From
those, an affine model per packet is fitted:

```text
reference = device + offset + drift * (device - pivot)
```

The model is a plain value. It is cached by [`ClockResolver`] per packet,
which also lends the models of neighbouring packets of the same device to
packets which do not carry exchanges of their own.
*/
use std::cmp::Ordering;
use std::fmt;

use crate::packet::Micros;

mod fit;
mod resolve;
pub mod stats;
pub mod tri;

pub use fit::{fit, FitParams};
pub use resolve::{ClockResolver, Interpolate, LinearInterpolation, Neighbour, Resolved};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
	InsufficientSyncData{have: usize},
	NoClockReference,
}

impl fmt::Display for SyncError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::InsufficientSyncData{have} => write!(f, "insufficient synchronization data ({} exchanges)", have),
			Self::NoClockReference => f.write_str("no clock reference for packet or its neighbours"),
		}
	}
}

impl std::error::Error for SyncError {}

/// How a clock model came to be, worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Grade {
	/// No reference at all; times are device-times.
	Uncorrected,
	/// Interpolated from neighbouring packets of the same device.
	Borrowed,
	/// Fitted from a single exchange; drift is assumed zero.
	OffsetOnly,
	Fitted,
}

impl fmt::Display for Grade {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Self::Uncorrected => "uncorrected",
			Self::Borrowed => "borrowed",
			Self::OffsetOnly => "offset-only",
			Self::Fitted => "fitted",
		})
	}
}

/// Trust in a set of corrected timestamps. Greater is better.
///
/// Ordered by grade, then by whether any timestamp had to be extrapolated,
/// then by the best exchange latency (lower is better).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Confidence {
	pub grade: Grade,
	pub extrapolated: bool,
	pub best_latency: u64,
}

impl Confidence {
	pub const LOWEST: Confidence = Confidence{
		grade: Grade::Uncorrected,
		extrapolated: true,
		best_latency: u64::MAX,
	};
}

impl Ord for Confidence {
	fn cmp(&self, other: &Self) -> Ordering {
		self.grade.cmp(&other.grade)
			.then_with(|| other.extrapolated.cmp(&self.extrapolated))
			.then_with(|| other.best_latency.cmp(&self.best_latency))
	}
}

impl PartialOrd for Confidence {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for Confidence {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.grade)?;
		if self.extrapolated {
			f.write_str(", extrapolated")?;
		}
		if self.best_latency != u64::MAX {
			write!(f, ", {}µs", self.best_latency)?;
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corrected {
	pub time: Micros,
	/// The device-time lay outside the span the model was fitted on.
	pub extrapolated: bool,
}

/// Affine mapping of device-time to reference-time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockModel {
	pub pivot: Micros,
	/// Correction at the pivot.
	pub offset: i64,
	/// Additional correction per microsecond of distance from the pivot.
	pub drift: f64,
	/// Device-time span covered by the exchanges the model was derived from.
	pub domain: (Micros, Micros),
	pub grade: Grade,
	pub best_latency: u64,
}

impl ClockModel {
	/// Leave device-times untouched.
	pub fn identity() -> Self {
		Self{
			pivot: 0,
			offset: 0,
			drift: 0.0,
			domain: (Micros::MIN, Micros::MAX),
			grade: Grade::Uncorrected,
			best_latency: u64::MAX,
		}
	}

	/// Correction (reference minus device) at `t`.
	pub fn correction_at(&self, t: Micros) -> i64 {
		let distance = t as f64 - self.pivot as f64;
		self.offset.saturating_add((self.drift * distance).round() as i64)
	}

	pub fn apply(&self, t: Micros) -> Corrected {
		Corrected{
			time: t.saturating_add(self.correction_at(t)),
			extrapolated: t < self.domain.0 || t > self.domain.1,
		}
	}

	/// Confidence in times corrected with this model over `[start, end]`.
	pub fn confidence(&self, start: Micros, end: Micros) -> Confidence {
		if self.grade == Grade::Uncorrected {
			return Confidence::LOWEST
		}
		Confidence{
			grade: self.grade,
			extrapolated: start < self.domain.0 || end > self.domain.1,
			best_latency: self.best_latency,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn model(offset: i64, drift: f64) -> ClockModel {
		ClockModel{
			pivot: 1_000,
			offset,
			drift,
			domain: (0, 2_000),
			grade: Grade::Fitted,
			best_latency: 10,
		}
	}

	#[test]
	fn apply_is_affine() {
		let m = model(500, 0.001);
		assert_eq!(m.apply(1_000).time, 1_500);
		assert_eq!(m.apply(2_000).time, 2_501);
		assert_eq!(m.apply(0).time, -1 + 500);
	}

	#[test]
	fn apply_flags_extrapolation() {
		let m = model(0, 0.0);
		assert!(!m.apply(0).extrapolated);
		assert!(!m.apply(2_000).extrapolated);
		assert!(m.apply(-1).extrapolated);
		assert!(m.apply(2_001).extrapolated);
	}

	#[test]
	fn apply_is_monotonic_for_nonnegative_drift() {
		for drift in [0.0, 1e-6, 0.37, 2.5].iter() {
			let m = model(-12_345, *drift);
			let mut prev = m.apply(-5_000).time;
			for t in -4_999..5_000 {
				let now = m.apply(t).time;
				assert!(now >= prev, "drift {} not monotonic at {}", drift, t);
				prev = now;
			}
		}
	}

	#[test]
	fn identity_keeps_times() {
		let m = ClockModel::identity();
		assert_eq!(m.apply(123_456).time, 123_456);
		assert_eq!(m.confidence(0, 10), Confidence::LOWEST);
	}

	#[test]
	fn confidence_orders_by_grade_extrapolation_latency() {
		let fitted = Confidence{grade: Grade::Fitted, extrapolated: false, best_latency: 100};
		let fitted_extrapolated = Confidence{extrapolated: true, ..fitted};
		let fitted_faster = Confidence{best_latency: 50, ..fitted};
		let offset_only = Confidence{grade: Grade::OffsetOnly, ..fitted_faster};
		let borrowed = Confidence{grade: Grade::Borrowed, ..fitted_faster};

		assert!(fitted_faster > fitted);
		assert!(fitted > fitted_extrapolated);
		assert!(fitted_extrapolated > offset_only);
		assert!(offset_only > borrowed);
		assert!(borrowed > Confidence::LOWEST);
	}
}
