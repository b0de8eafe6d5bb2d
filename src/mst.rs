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

//! Memory store shim.
//!
//! The MST owns address-space identifiers and the per-ASID owner UID table.
//! Area mappings are tracked only as records here; the process manager cares
//! about their success and ordering, not their contents.

use crate::{
	status::{KResult, Status},
	uid::Uid,
};
use std::sync::Mutex;

/// An address-space identifier.
pub type Asid = u16;

/// Number of address spaces.
pub const MAX_ASIDS: usize = 64;

const NO_ASID: Status = Status::External(0x0004_0001);
const BAD_ASID: Status = Status::External(0x0004_0002);

#[derive(Clone, Copy, Debug)]
struct Mapping {
	asid: Asid,
	desc: u32,
}

struct Inner {
	used: [bool; MAX_ASIDS],
	uid_table: [Uid; MAX_ASIDS],
	mappings: Vec<Mapping>,
}

/// The memory store.
pub struct Mst {
	inner: Mutex<Inner>,
}

impl Mst {
	/// Creates the store with ASID 1 reserved for the init process.
	pub fn new() -> Self {
		let mut used = [false; MAX_ASIDS];
		used[0] = true;
		used[1] = true;
		Self {
			inner: Mutex::new(Inner {
				used,
				uid_table: [Uid::NIL; MAX_ASIDS],
				mappings: Vec::new(),
			}),
		}
	}

	/// Allocates a fresh ASID.
	pub fn alloc_asid(&self) -> KResult<Asid> {
		let mut inner = self.inner.lock().unwrap();
		let asid = inner.used.iter().position(|used| !used).ok_or(NO_ASID)?;
		inner.used[asid] = true;
		Ok(asid as Asid)
	}

	/// Releases an ASID and drops its mappings.
	pub fn free_asid(&self, asid: Asid) -> KResult<()> {
		let mut inner = self.inner.lock().unwrap();
		if !inner.used.get(asid as usize).copied().unwrap_or(false) {
			return Err(BAD_ASID);
		}
		inner.used[asid as usize] = false;
		inner.mappings.retain(|m| m.asid != asid);
		Ok(())
	}

	/// Returns the owner UID recorded for the ASID.
	pub fn asid_uid(&self, asid: Asid) -> Uid {
		self.inner.lock().unwrap().uid_table[asid as usize]
	}

	/// Records the owner UID of the ASID.
	pub fn set_asid_uid(&self, asid: Asid, uid: Uid) {
		self.inner.lock().unwrap().uid_table[asid as usize] = uid;
	}

	/// Fills the whole owner UID table with `uid`.
	pub fn fill_uid_table(&self, uid: Uid) {
		let mut inner = self.inner.lock().unwrap();
		inner.uid_table = [uid; MAX_ASIDS];
	}

	/// Paints the initial area of an address space from a code descriptor.
	pub fn map_initial_area(
		&self,
		code_desc: u32,
		asid: Asid,
		_owner: &Uid,
		_map_param: u32,
		_flags: u32,
	) -> KResult<()> {
		let mut inner = self.inner.lock().unwrap();
		if !inner.used[asid as usize] {
			return Err(BAD_ASID);
		}
		inner.mappings.push(Mapping {
			asid,
			desc: code_desc,
		});
		Ok(())
	}

	/// Maps an area at a caller-chosen location.
	pub fn map_area_at(&self, asid: Asid, desc: u32) -> KResult<()> {
		let mut inner = self.inner.lock().unwrap();
		inner.mappings.push(Mapping {
			asid,
			desc,
		});
		Ok(())
	}

	/// Clones the parent's address space into the child's.
	pub fn fork(&self, child_asid: Asid, _child_pid: u16, _flags: u32) -> KResult<()> {
		let parent = crate::proc1::as_id();
		let mut inner = self.inner.lock().unwrap();
		if !inner.used[child_asid as usize] {
			return Err(BAD_ASID);
		}
		let copied: Vec<Mapping> = inner
			.mappings
			.iter()
			.filter(|m| m.asid == parent)
			.map(|m| Mapping {
				asid: child_asid,
				desc: m.desc,
			})
			.collect();
		inner.mappings.extend(copied);
		Ok(())
	}

	/// Returns the file UID backing the area holding `desc`, if mapped.
	pub fn get_va_info(&self, asid: Asid, desc: u32) -> KResult<Uid> {
		let inner = self.inner.lock().unwrap();
		if !inner.used[asid as usize] {
			return Err(BAD_ASID);
		}
		let _ = inner.mappings.iter().find(|m| m.asid == asid && m.desc == desc);
		Ok(inner.uid_table[asid as usize])
	}
}

impl Default for Mst {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn asid_alloc_free() {
		let mst = Mst::new();
		let a = mst.alloc_asid().unwrap();
		assert!(a >= 2);
		mst.free_asid(a).unwrap();
		assert_eq!(mst.alloc_asid().unwrap(), a);
	}

	#[test]
	fn uid_table() {
		let mst = Mst::new();
		let uid = Uid::generate();
		mst.fill_uid_table(uid);
		assert_eq!(mst.asid_uid(5), uid);
		let other = Uid::generate();
		mst.set_asid_uid(5, other);
		assert_eq!(mst.asid_uid(5), other);
		assert_eq!(mst.asid_uid(6), uid);
	}

	#[test]
	fn exhaustion_reports_external() {
		let mst = Mst::new();
		let mut last = Ok(0);
		for _ in 0..MAX_ASIDS {
			last = mst.alloc_asid();
		}
		assert!(matches!(last, Err(Status::External(_))));
	}
}
