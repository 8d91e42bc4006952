/*!
Tri-message synchronization.

A tri-message exchange consists of three messages between the reference
server (timestamps `a`) and the device (timestamps `b`):

1. server sends at `a1`, device receives at `b1`,
2. device sends at `b2`, server receives at `a2`,
3. server sends at `a3`, device receives at `b3`.

Each of the two round trips yields a latency estimate and with it one
device-time/reference-time pair.
*/
use crate::packet::{Micros, SyncExchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriMessage {
	pub a1: Micros,
	pub a2: Micros,
	pub a3: Micros,
	pub b1: Micros,
	pub b2: Micros,
	pub b3: Micros,
}

impl TriMessage {
	/// One-way latencies of the server-initiated and device-initiated round trips.
	///
	/// Negative values cannot happen physically and are clamped to zero.
	pub fn latencies(&self) -> (f64, f64) {
		let d1 = 0.5 * (self.a2.saturating_sub(self.a1) as f64 - self.b2.saturating_sub(self.b1) as f64);
		let d3 = 0.5 * (self.b3.saturating_sub(self.b2) as f64 - self.a3.saturating_sub(self.a2) as f64);
		(d1.max(0.0), d3.max(0.0))
	}

	/// Offsets (reference minus device) for both round trips.
	pub fn offsets(&self) -> (f64, f64) {
		let (d1, d3) = self.latencies();
		(self.a1.saturating_sub(self.b1) as f64 + d1, self.a3.saturating_sub(self.b3) as f64 + d3)
	}

	pub fn exchanges(&self) -> [SyncExchange; 2] {
		let (d1, d3) = self.latencies();
		let (o1, o3) = self.offsets();
		[
			SyncExchange{
				device_time: self.b1,
				reference_time: self.b1.saturating_add(o1.round() as i64),
				latency: d1.round() as u64,
			},
			SyncExchange{
				device_time: self.b3,
				reference_time: self.b3.saturating_add(o3.round() as i64),
				latency: d3.round() as u64,
			},
		]
	}
}

/// Flatten tri-messages into exchanges ordered by device-time.
pub fn exchanges(messages: &[TriMessage]) -> Vec<SyncExchange> {
	let mut out: Vec<SyncExchange> = messages.iter().flat_map(|m| m.exchanges().to_vec()).collect();
	out.sort_by_key(|x| x.device_time);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	// device clock runs 1000µs behind, 50µs each way
	fn symmetric() -> TriMessage {
		TriMessage{
			a1: 10_000,
			b1: 9_050,
			b2: 9_100,
			a2: 10_150,
			a3: 10_200,
			b3: 9_250,
		}
	}

	#[test]
	fn latencies_of_symmetric_exchange() {
		assert_eq!(symmetric().latencies(), (50.0, 50.0));
	}

	#[test]
	fn offsets_of_symmetric_exchange() {
		assert_eq!(symmetric().offsets(), (1000.0, 1000.0));
	}

	#[test]
	fn exchanges_map_device_receive_times() {
		let [first, second] = symmetric().exchanges();
		assert_eq!(first, SyncExchange{device_time: 9_050, reference_time: 10_050, latency: 50});
		assert_eq!(second, SyncExchange{device_time: 9_250, reference_time: 10_250, latency: 50});
	}

	#[test]
	fn negative_latencies_are_clamped() {
		let mut m = symmetric();
		m.a2 = m.a1;
		let (d1, _) = m.latencies();
		assert_eq!(d1, 0.0);
	}

	#[test]
	fn flattened_exchanges_are_ordered() {
		let later = TriMessage{a1: 20_000, b1: 19_050, b2: 19_100, a2: 20_150, a3: 20_200, b3: 19_250};
		let xs = exchanges(&[later, symmetric()]);
		assert_eq!(xs.len(), 4);
		assert!(xs.windows(2).all(|w| w[0].device_time <= w[1].device_time));
	}
}
