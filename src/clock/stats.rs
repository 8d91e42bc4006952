use crate::packet::{Micros, Packet, SyncExchange};

/// Summary of a packet's synchronization exchanges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStats {
	pub exchanges: usize,
	/// Lowest non-zero latency, or zero if all latencies are zero.
	pub best_latency: u64,
	/// Offset of the exchange with the best latency.
	pub best_offset: i64,
	pub mean_latency: f64,
	pub latency_std: f64,
	pub mean_offset: f64,
	pub offset_std: f64,
}

fn mean_std<I: Iterator<Item = f64> + Clone>(vs: I) -> (f64, f64) {
	let n = vs.clone().count() as f64;
	let mean = vs.clone().sum::<f64>() / n;
	let var = vs.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
	(mean, var.sqrt())
}

pub fn summarize(exchanges: &[SyncExchange]) -> Option<SyncStats> {
	if exchanges.is_empty() {
		return None
	}
	// zero latencies are clamped artefacts, prefer a measured one
	let best = exchanges.iter()
		.filter(|x| x.latency != 0)
		.min_by_key(|x| x.latency)
		.unwrap_or(&exchanges[0]);
	let (mean_latency, latency_std) = mean_std(exchanges.iter().map(|x| x.latency as f64));
	let (mean_offset, offset_std) = mean_std(exchanges.iter().map(|x| x.offset() as f64));
	Some(SyncStats{
		exchanges: exchanges.len(),
		best_latency: best.latency,
		best_offset: best.offset(),
		mean_latency,
		latency_std,
		mean_offset,
		offset_std,
	})
}

/// Time between the corrected end of the recording and the server receiving it.
pub fn travel_time(packet: &Packet, stats: &SyncStats) -> Option<Micros> {
	packet.server_arrival.map(|arrival| arrival.saturating_sub(packet.end.saturating_add(stats.best_offset)))
}
