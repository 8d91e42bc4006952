use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use env_logger;

use log::warn;

use sensor_stream::config::Config;
use sensor_stream::index::Segment;
use sensor_stream::ingest::{CancelFlag, Engine};
use sensor_stream::packet::to_datetime;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "stitch")]
struct Opt {
	/// TOML configuration file
	#[structopt(short, long, parse(from_os_str))]
	config: Option<PathBuf>,
	/// Print every segment of every stream
	#[structopt(short, long)]
	segments: bool,
	#[structopt(parse(from_os_str))]
	packets: Vec<PathBuf>,
}

fn display_time(t: i64) -> String {
	match to_datetime(t) {
		Some(dt) => dt.to_string(),
		None => format!("{}µs", t),
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	env_logger::init();
	let opt = Opt::from_args();

	let config = match opt.config.as_ref() {
		Some(path) => Config::load(path)?,
		None => Config::default(),
	};
	let engine = Arc::new(Engine::new(config));

	let mut batch = Vec::with_capacity(opt.packets.len());
	let mut names = Vec::with_capacity(opt.packets.len());
	for path in opt.packets.iter() {
		match std::fs::read(path) {
			Ok(raw) => {
				batch.push(Bytes::from(raw));
				names.push(path.display().to_string());
			},
			Err(e) => warn!("failed to read {}: {}", path.display(), e),
		}
	}

	let outcomes = engine.clone().ingest(batch, CancelFlag::new()).await;
	for (name, outcome) in names.iter().zip(outcomes.iter()) {
		println!("{}: {}", name, outcome);
	}

	let index = engine.index();
	for key in index.keys() {
		let stream = match index.stream(&key.device, key.kind) {
			Some(stream) => stream,
			None => continue,
		};
		let (start, end) = match stream.span() {
			Some(span) => span,
			None => continue,
		};
		println!(
			"{}: {} samples at {}µs in {} runs, {} .. {}",
			key, stream.len(), stream.period_us(), stream.runs().len(),
			display_time(start), display_time(end),
		);
		for gap in stream.gaps() {
			println!("  gap {} ({}µs)", gap, gap.end - gap.start);
		}
		let conflicts = index.conflicts(&key.device, key.kind);
		if !conflicts.is_empty() {
			println!("  {} conflicts", conflicts.len());
		}
		if opt.segments {
			for segment in index.query(&key.device, key.kind, start, end) {
				match segment {
					Segment::Data{start, end, samples} => println!("  data [{}, {}) {} samples", start, end, samples.len()),
					Segment::Gap(gap) => println!("  gap {}", gap),
				}
			}
		}
	}
	for device in index.keys().iter().map(|k| k.device.clone()).collect::<std::collections::BTreeSet<_>>() {
		let anomalies = index.anomalies(&device);
		if !anomalies.is_empty() {
			println!("{}: {} anomalous samples", device, anomalies.len());
		}
	}
	Ok(())
}
