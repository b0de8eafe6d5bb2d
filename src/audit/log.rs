/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Aegis.
 *
 * Aegis is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Aegis is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Aegis. If not, see <https://www.gnu.org/licenses/>.
 */

//! The audit log file.
//!
//! The log is an unstructured append-only file. While logging is active a
//! 32 KiB window starting at `file_offset` is kept in memory; records are
//! appended into the window and written back on flush. When a record does
//! not fit, the window is written out and re-established at the new offset.
//!
//! All multi-byte record fields are little-endian.

use crate::{status::KResult, uid::Uid};
use byteorder::{ByteOrder, LittleEndian};
use std::{
	fs::{File, OpenOptions},
	io::{Read, Seek, SeekFrom, Write},
	path::Path,
};

/// Size of the mapped log window.
pub const BUFFER_MAP_SIZE: usize = 0x8000;

/// Size of an event record header.
pub const RECORD_HEADER_SIZE: usize = 0x46;

/// Maximum data bytes per event record.
pub const MAX_DATA_SIZE: usize = 0x800;

/// An audit event record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EventRecord {
	pub record_size: u16,
	pub version: u16,
	pub sid: [u8; 36],
	pub event_flags: u16,
	/// Node identifier in the upper 20 bits.
	pub node_id: u32,
	pub event_uid: Uid,
	pub status: u32,
	pub timestamp: u32,
	/// Level-1 PID of the logging process.
	pub process_id: u16,
	pub upid: u16,
	pub upgid: u16,
	pub data: Vec<u8>,
}

impl EventRecord {
	/// Total size of a record holding `data_len` bytes: header, data, NUL
	/// terminator, rounded up to even.
	pub fn size_for(data_len: usize) -> u16 {
		let size = RECORD_HEADER_SIZE + data_len + 1;
		(size + (size & 1)) as u16
	}

	/// Serializes the record into `out`.
	pub fn encode(&self, out: &mut [u8]) {
		LittleEndian::write_u16(&mut out[0x00..], self.record_size);
		LittleEndian::write_u16(&mut out[0x02..], self.version);
		out[0x04..0x28].copy_from_slice(&self.sid);
		LittleEndian::write_u16(&mut out[0x28..], self.event_flags);
		LittleEndian::write_u32(&mut out[0x2A..], self.node_id);
		LittleEndian::write_u32(&mut out[0x2E..], self.event_uid.high);
		LittleEndian::write_u32(&mut out[0x32..], self.event_uid.low);
		LittleEndian::write_u32(&mut out[0x36..], self.status);
		LittleEndian::write_u32(&mut out[0x3A..], self.timestamp);
		LittleEndian::write_u16(&mut out[0x40..], self.process_id);
		LittleEndian::write_u16(&mut out[0x42..], self.upid);
		LittleEndian::write_u16(&mut out[0x44..], self.upgid);
		out[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + self.data.len()]
			.copy_from_slice(&self.data);
		out[RECORD_HEADER_SIZE + self.data.len()] = 0;
	}

	/// Parses one record at the head of `bytes`, returning it and the
	/// number of bytes consumed.
	///
	/// The data length is recovered from the record size minus the NUL
	/// terminator; an even-length payload therefore reads back with its
	/// terminator attached.
	pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
		if bytes.len() < RECORD_HEADER_SIZE {
			return None;
		}
		let record_size = LittleEndian::read_u16(&bytes[0x00..]) as usize;
		if record_size < RECORD_HEADER_SIZE + 1 || record_size > bytes.len() {
			return None;
		}
		let mut sid = [0u8; 36];
		sid.copy_from_slice(&bytes[0x04..0x28]);
		let data_len = record_size - RECORD_HEADER_SIZE - 1;
		let record = Self {
			record_size: record_size as u16,
			version: LittleEndian::read_u16(&bytes[0x02..]),
			sid,
			event_flags: LittleEndian::read_u16(&bytes[0x28..]),
			node_id: LittleEndian::read_u32(&bytes[0x2A..]),
			event_uid: Uid {
				high: LittleEndian::read_u32(&bytes[0x2E..]),
				low: LittleEndian::read_u32(&bytes[0x32..]),
			},
			status: LittleEndian::read_u32(&bytes[0x36..]),
			timestamp: LittleEndian::read_u32(&bytes[0x3A..]),
			process_id: LittleEndian::read_u16(&bytes[0x40..]),
			upid: LittleEndian::read_u16(&bytes[0x42..]),
			upgid: LittleEndian::read_u16(&bytes[0x44..]),
			data: bytes[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data_len].to_vec(),
		};
		Some((record, record_size))
	}

	/// Parses every record of a log image.
	pub fn decode_all(mut bytes: &[u8]) -> Vec<Self> {
		let mut out = Vec::new();
		while let Some((record, consumed)) = Self::decode(bytes) {
			out.push(record);
			bytes = &bytes[consumed..];
		}
		out
	}
}

/// The open audit log: backing file plus the write window.
pub struct LogFile {
	pub uid: Uid,
	file: File,
	pub lock_id: u32,
	buffer: Vec<u8>,
	/// Bytes of the window already filled.
	pub write_pos: usize,
	pub bytes_remaining: usize,
	/// File offset the window starts at.
	pub file_offset: u64,
	pub dirty: bool,
}

impl LogFile {
	/// Opens the backing file and establishes the window at its end.
	pub fn open(path: &Path, uid: Uid, lock_id: u32, file_offset: u64) -> KResult<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		Ok(Self {
			uid,
			file,
			lock_id,
			buffer: vec![0; BUFFER_MAP_SIZE],
			write_pos: 0,
			bytes_remaining: BUFFER_MAP_SIZE,
			file_offset,
			dirty: false,
		})
	}

	/// Writes the filled part of the window back at `file_offset`.
	pub fn flush(&mut self) -> KResult<()> {
		self.file.seek(SeekFrom::Start(self.file_offset))?;
		self.file.write_all(&self.buffer[..self.write_pos])?;
		self.file.sync_all()?;
		Ok(())
	}

	/// Moves the window past the written bytes: flushes, advances
	/// `file_offset`, and resets the window.
	pub fn remap(&mut self) -> KResult<()> {
		self.flush()?;
		self.file_offset += self.write_pos as u64;
		self.write_pos = 0;
		self.bytes_remaining = BUFFER_MAP_SIZE;
		self.buffer.fill(0);
		Ok(())
	}

	/// Appends an encoded record to the window. The caller has checked
	/// that it fits.
	pub fn append(&mut self, record: &EventRecord) {
		let size = record.record_size as usize;
		record.encode(&mut self.buffer[self.write_pos..self.write_pos + size]);
		self.write_pos += size;
		self.bytes_remaining -= size;
		self.dirty = true;
	}

	/// Logical end of the log.
	pub fn logical_end(&self) -> u64 {
		self.file_offset + self.write_pos as u64
	}

	/// Reads the whole logical log image, window included.
	pub fn read_image(&mut self) -> KResult<Vec<u8>> {
		let mut image = Vec::new();
		self.file.seek(SeekFrom::Start(0))?;
		self.file.read_to_end(&mut image)?;
		image.truncate(self.file_offset as usize);
		image.extend_from_slice(&self.buffer[..self.write_pos]);
		Ok(image)
	}

	/// Truncates the backing file to the logical end.
	pub fn truncate_to_end(&mut self) -> KResult<()> {
		let end = self.logical_end();
		self.file.set_len(end)?;
		self.file.sync_all()?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample(data: &[u8]) -> EventRecord {
		EventRecord {
			record_size: EventRecord::size_for(data.len()),
			version: 1,
			sid: [7; 36],
			event_flags: 3,
			node_id: 0x1000,
			event_uid: Uid {
				high: 0xABCD,
				low: 42,
			},
			status: 0x19000D,
			timestamp: 1234,
			process_id: 5,
			upid: 70,
			upgid: 100,
			data: data.to_vec(),
		}
	}

	#[test]
	fn record_size_rounds_to_even() {
		assert_eq!(EventRecord::size_for(0), 0x48);
		assert_eq!(EventRecord::size_for(1), 0x48);
		assert_eq!(EventRecord::size_for(2), 0x4A);
		assert_eq!(EventRecord::size_for(3), 0x4A);
	}

	#[test]
	fn encode_decode_roundtrip() {
		let record = sample(b"hello audit");
		let mut buf = vec![0u8; record.record_size as usize];
		record.encode(&mut buf);
		let (decoded, consumed) = EventRecord::decode(&buf).unwrap();
		assert_eq!(consumed, record.record_size as usize);
		assert_eq!(decoded, record);
	}

	#[test]
	fn window_wrap_advances_offset() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("audit_log");
		std::fs::File::create(&path).unwrap();
		let mut log = LogFile::open(&path, Uid::generate(), 1, 0).unwrap();
		let record = sample(&[0xAA; 101]);
		log.append(&record);
		let filled = log.write_pos;
		assert_eq!(log.bytes_remaining, BUFFER_MAP_SIZE - filled);
		log.remap().unwrap();
		assert_eq!(log.file_offset, filled as u64);
		assert_eq!(log.write_pos, 0);
		assert_eq!(log.bytes_remaining, BUFFER_MAP_SIZE);
		// The flushed record is on disk
		let image = log.read_image().unwrap();
		let records = EventRecord::decode_all(&image);
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].data, vec![0xAA; 101]);
	}
}
