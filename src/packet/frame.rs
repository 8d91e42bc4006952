use std::convert::TryInto;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use smartstring::alias::{String as SmartString};

use super::delta;
use super::{ChannelBlock, ChannelKind, DecodeError, Location, Packet, RawData, SyncExchange, ValueKind};

fn corrupt<S: Into<String>>(why: S) -> DecodeError {
	DecodeError::CorruptPacket(why.into())
}

fn need<B: Buf>(r: &B, n: usize, what: &str) -> Result<(), DecodeError> {
	if r.remaining() < n {
		return Err(corrupt(format!("not enough bytes for {}", what)))
	}
	Ok(())
}

const I64_LEN: usize = std::mem::size_of::<i64>();
const F64_LEN: usize = std::mem::size_of::<f64>();

impl SyncExchange {
	pub const RAW_LEN: usize = I64_LEN * 2 + std::mem::size_of::<u64>();

	fn read<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		need(r, Self::RAW_LEN, "synchronization exchange")?;
		let device_time = r.get_i64_le();
		let reference_time = r.get_i64_le();
		let latency = r.get_u64_le();
		Ok(Self{
			device_time,
			reference_time,
			latency,
		})
	}

	fn write<W: BufMut>(&self, w: &mut W) {
		w.put_i64_le(self.device_time);
		w.put_i64_le(self.reference_time);
		w.put_u64_le(self.latency);
	}
}

impl Location {
	pub const RAW_LEN: usize = F64_LEN * 4;

	fn read<R: Buf>(r: &mut R) -> Self {
		let latitude = r.get_f64_le();
		let longitude = r.get_f64_le();
		let altitude = r.get_f64_le();
		let accuracy = r.get_f64_le();
		Self{
			latitude,
			longitude,
			altitude,
			accuracy,
		}
	}

	fn write<W: BufMut>(&self, w: &mut W) {
		w.put_f64_le(self.latitude);
		w.put_f64_le(self.longitude);
		w.put_f64_le(self.altitude);
		w.put_f64_le(self.accuracy);
	}
}

impl RawData {
	fn read<R: Buf>(r: &mut R, kind: ValueKind, n: usize) -> Result<Self, DecodeError> {
		match kind {
			ValueKind::Audio => {
				need(r, std::mem::size_of::<u16>() + std::mem::size_of::<u32>(), "audio coding header")?;
				let reference = r.get_u16_le();
				let coded_len = r.get_u32_le() as usize;
				need(r, coded_len, "audio samples")?;
				let coded = r.copy_to_bytes(coded_len);
				match delta::decode(reference, coded, n) {
					Ok(samples) => Ok(Self::Audio(samples)),
					Err(e) => Err(corrupt(format!("audio {}", e.0))),
				}
			},
			ValueKind::Scalar => {
				need(r, n.saturating_mul(F64_LEN), "scalar samples")?;
				Ok(Self::Scalar((0..n).map(|_| r.get_f64_le()).collect()))
			},
			ValueKind::Xyz => {
				need(r, n.saturating_mul(F64_LEN * 3), "xyz samples")?;
				Ok(Self::Xyz((0..n).map(|_| [r.get_f64_le(), r.get_f64_le(), r.get_f64_le()]).collect()))
			},
			ValueKind::Location => {
				need(r, n.saturating_mul(Location::RAW_LEN), "location samples")?;
				Ok(Self::Location((0..n).map(|_| Location::read(r)).collect()))
			},
		}
	}

	fn write<W: BufMut>(&self, w: &mut W) {
		match self {
			Self::Audio(vs) => {
				let (reference, coded) = delta::encode(&vs[..]);
				w.put_u16_le(reference);
				w.put_u32_le(coded.len() as u32);
				w.put(coded);
			},
			Self::Scalar(vs) => {
				for v in vs.iter() {
					w.put_f64_le(*v);
				}
			},
			Self::Xyz(vs) => {
				for [x, y, z] in vs.iter() {
					w.put_f64_le(*x);
					w.put_f64_le(*y);
					w.put_f64_le(*z);
				}
			},
			Self::Location(vs) => {
				for v in vs.iter() {
					v.write(w);
				}
			},
		}
	}
}

impl ChannelBlock {
	pub const RAW_BASE_LEN: usize =
		std::mem::size_of::<u8>() +
		std::mem::size_of::<u32>() +
		std::mem::size_of::<u32>();

	fn read<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		need(r, Self::RAW_BASE_LEN, "channel block header")?;
		let tag = r.get_u8();
		let kind: ChannelKind = match tag.try_into() {
			Ok(v) => v,
			Err(_) => return Err(corrupt(format!("unknown channel tag {:#04x}", tag))),
		};
		let period_us = r.get_u32_le();
		let n = r.get_u32_le() as usize;
		need(r, n.saturating_mul(I64_LEN), "sample timestamps")?;
		let timestamps = (0..n).map(|_| r.get_i64_le()).collect();
		let data = RawData::read(r, kind.value_kind(), n)?;
		Ok(Self{
			kind,
			period_us,
			timestamps,
			data,
		})
	}

	fn write<W: BufMut>(&self, w: &mut W) {
		w.put_u8(self.kind as u8);
		w.put_u32_le(self.period_us);
		w.put_u32_le(self.timestamps.len() as u32);
		for t in self.timestamps.iter() {
			w.put_i64_le(*t);
		}
		self.data.write(w);
	}
}

/// Parse a decompressed body. The version tag has been vetted by the envelope.
pub fn read_body(mut r: Bytes, version: u8) -> Result<Packet, DecodeError> {
	need(&r, std::mem::size_of::<u16>(), "device identifier length")?;
	let id_len = r.get_u16_le() as usize;
	need(&r, id_len, "device identifier")?;
	let raw_id = r.copy_to_bytes(id_len);
	let device_id: SmartString = match std::str::from_utf8(&raw_id[..]) {
		Ok(s) => s.into(),
		Err(_) => return Err(corrupt("device identifier is not UTF-8")),
	};

	need(&r, I64_LEN * 2 + 1, "packet span")?;
	let start = r.get_i64_le();
	let end = r.get_i64_le();
	let server_arrival = match r.get_u8() {
		0 => None,
		1 => {
			need(&r, I64_LEN, "server arrival time")?;
			Some(r.get_i64_le())
		},
		other => return Err(corrupt(format!("invalid arrival presence flag {}", other))),
	};

	need(&r, std::mem::size_of::<u16>(), "exchange count")?;
	let nexchanges = r.get_u16_le() as usize;
	let mut exchanges = Vec::with_capacity(nexchanges);
	for _ in 0..nexchanges {
		exchanges.push(SyncExchange::read(&mut r)?);
	}

	need(&r, std::mem::size_of::<u8>(), "block count")?;
	let nblocks = r.get_u8() as usize;
	let mut blocks = Vec::with_capacity(nblocks);
	for _ in 0..nblocks {
		blocks.push(ChannelBlock::read(&mut r)?);
	}

	if r.has_remaining() {
		return Err(corrupt(format!("{} trailing bytes after last block", r.remaining())))
	}

	let packet = Packet{
		device_id,
		version,
		start,
		end,
		server_arrival,
		exchanges,
		blocks,
	};
	match packet.check() {
		Ok(()) => Ok(packet),
		Err(why) => Err(corrupt(why)),
	}
}

/// Serialize the body. The packet must have passed `Packet::check`.
pub fn write_body(packet: &Packet) -> Bytes {
	let mut w = BytesMut::new();
	w.put_u16_le(packet.device_id.len() as u16);
	w.put_slice(packet.device_id.as_bytes());
	w.put_i64_le(packet.start);
	w.put_i64_le(packet.end);
	match packet.server_arrival {
		None => w.put_u8(0),
		Some(t) => {
			w.put_u8(1);
			w.put_i64_le(t);
		},
	}
	w.put_u16_le(packet.exchanges.len() as u16);
	for x in packet.exchanges.iter() {
		x.write(&mut w);
	}
	w.put_u8(packet.blocks.len() as u8);
	for b in packet.blocks.iter() {
		b.write(&mut w);
	}
	w.freeze()
}

pub fn digest(packet: &Packet) -> u64 {
	seahash::hash(&write_body(packet)[..])
}
