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

//! The selective audit list.
//!
//! `//node_data/audit/audit_list` is a 16-byte header followed by up to 256
//! UIDs. When the SELECTIVE flag is set, only events whose UID appears in
//! the list are logged. The UIDs are hashed into 37 buckets for lookup on
//! the logging path. All fields are little-endian.

use crate::{
	status::{KResult, Status},
	uid::Uid,
};
use byteorder::{ByteOrder, LittleEndian};

/// Number of hash buckets.
pub const HASH_BUCKETS: usize = 37;

/// Highest supported list format version.
pub const LIST_VERSION_MAX: u16 = 1;

/// Maximum number of UIDs in the list.
pub const MAX_LIST_ENTRIES: usize = 0x100;

/// Size of the list header.
pub const LIST_HEADER_SIZE: usize = 0x10;

bitflags::bitflags! {
	/// Audit list flags.
	#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
	pub struct ListFlags: u16 {
		/// Only audit UIDs present in the list.
		const SELECTIVE = 0x0001;
		/// Flush the log periodically.
		const TIMEOUT = 0x0002;
	}
}

/// Parsed form of the audit list file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditList {
	pub list_uid: Uid,
	/// Flush timeout in 4-second units; 0 selects the default.
	pub timeout_units: u16,
	pub flags: ListFlags,
	pub entries: Vec<Uid>,
}

impl AuditList {
	/// Parses the on-disk list.
	pub fn parse(bytes: &[u8]) -> KResult<Self> {
		if bytes.len() < LIST_HEADER_SIZE {
			return Err(Status::EventListNotCurrentFormat);
		}
		let version = LittleEndian::read_u16(&bytes[0x0A..]);
		if version > LIST_VERSION_MAX {
			return Err(Status::EventListNotCurrentFormat);
		}
		let entry_count = LittleEndian::read_u16(&bytes[0x0C..]) as usize;
		if entry_count > MAX_LIST_ENTRIES {
			return Err(Status::ExcessiveEventTypes);
		}
		if bytes.len() < LIST_HEADER_SIZE + entry_count * 8 {
			return Err(Status::EventListNotCurrentFormat);
		}
		let entries = (0..entry_count)
			.map(|i| {
				let at = LIST_HEADER_SIZE + i * 8;
				Uid {
					high: LittleEndian::read_u32(&bytes[at..]),
					low: LittleEndian::read_u32(&bytes[at + 4..]),
				}
			})
			.collect();
		Ok(Self {
			list_uid: Uid {
				high: LittleEndian::read_u32(&bytes[0x00..]),
				low: LittleEndian::read_u32(&bytes[0x04..]),
			},
			timeout_units: LittleEndian::read_u16(&bytes[0x08..]),
			flags: ListFlags::from_bits_truncate(LittleEndian::read_u16(&bytes[0x0E..])),
			entries,
		})
	}

	/// Serializes the list, for tooling and tests.
	pub fn to_bytes(&self) -> Vec<u8> {
		let mut out = vec![0u8; LIST_HEADER_SIZE + self.entries.len() * 8];
		LittleEndian::write_u32(&mut out[0x00..], self.list_uid.high);
		LittleEndian::write_u32(&mut out[0x04..], self.list_uid.low);
		LittleEndian::write_u16(&mut out[0x08..], self.timeout_units);
		LittleEndian::write_u16(&mut out[0x0A..], 1);
		LittleEndian::write_u16(&mut out[0x0C..], self.entries.len() as u16);
		LittleEndian::write_u16(&mut out[0x0E..], self.flags.bits());
		for (i, uid) in self.entries.iter().enumerate() {
			let at = LIST_HEADER_SIZE + i * 8;
			LittleEndian::write_u32(&mut out[at..], uid.high);
			LittleEndian::write_u32(&mut out[at + 4..], uid.low);
		}
		out
	}
}

/// The UID hash table consulted on the logging path.
#[derive(Clone, Debug)]
pub struct HashTable {
	buckets: Vec<Vec<Uid>>,
}

impl Default for HashTable {
	fn default() -> Self {
		Self {
			buckets: vec![Vec::new(); HASH_BUCKETS],
		}
	}
}

impl HashTable {
	pub fn clear(&mut self) {
		for bucket in &mut self.buckets {
			bucket.clear();
		}
	}

	pub fn insert(&mut self, uid: Uid) {
		let bucket = uid.bucket(HASH_BUCKETS as u16) as usize;
		self.buckets[bucket].push(uid);
	}

	pub fn contains(&self, uid: Uid) -> bool {
		let bucket = uid.bucket(HASH_BUCKETS as u16) as usize;
		self.buckets[bucket].contains(&uid)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn list(entries: Vec<Uid>) -> AuditList {
		AuditList {
			list_uid: Uid::generate(),
			timeout_units: 2,
			flags: ListFlags::SELECTIVE | ListFlags::TIMEOUT,
			entries,
		}
	}

	#[test]
	fn parse_roundtrip() {
		let original = list(vec![Uid::generate(), Uid::generate()]);
		let parsed = AuditList::parse(&original.to_bytes()).unwrap();
		assert_eq!(parsed.list_uid, original.list_uid);
		assert_eq!(parsed.timeout_units, 2);
		assert_eq!(parsed.flags, original.flags);
		assert_eq!(parsed.entries, original.entries);
	}

	#[test]
	fn future_version_rejected() {
		let mut bytes = list(vec![]).to_bytes();
		LittleEndian::write_u16(&mut bytes[0x0A..], 2);
		assert_eq!(
			AuditList::parse(&bytes),
			Err(Status::EventListNotCurrentFormat)
		);
	}

	#[test]
	fn excessive_entries_rejected() {
		let mut bytes = list(vec![]).to_bytes();
		LittleEndian::write_u16(&mut bytes[0x0C..], 0x101);
		assert_eq!(AuditList::parse(&bytes), Err(Status::ExcessiveEventTypes));
	}

	#[test]
	fn hash_lookup() {
		let mut table = HashTable::default();
		let a = Uid::generate();
		let b = Uid::generate();
		table.insert(a);
		assert!(table.contains(a));
		assert!(!table.contains(b));
		table.clear();
		assert!(!table.contains(a));
	}
}
