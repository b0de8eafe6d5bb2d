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

//! Access control shim.
//!
//! Each task carries a SID (user, group, organization and login UIDs).
//! Kernel paths that must bypass access checks bracket themselves with
//! [`Acl::enter_super`]/[`Acl::exit_super`]; super mode nests per thread.

use crate::{
	proc1,
	proc1::Pid,
	status::{KResult, Status},
	uid::Uid,
};
use std::{cell::Cell, collections::HashMap, sync::Mutex};

/// Rights value granting administration of an object.
pub const RIGHTS_ADMIN: u32 = 2;

thread_local! {
	static SUPER_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// A security identifier block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Sid {
	pub user: Uid,
	pub group: Uid,
	pub org: Uid,
	pub login: Uid,
}

impl Sid {
	/// Serializes the SID into its 36-byte record form.
	pub fn to_bytes(self) -> [u8; 36] {
		let mut out = [0u8; 36];
		let words = [
			self.user.high,
			self.user.low,
			self.group.high,
			self.group.low,
			self.org.high,
			self.org.low,
			self.login.high,
			self.login.low,
			0,
		];
		for (i, w) in words.iter().enumerate() {
			out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
		}
		out
	}
}

struct Inner {
	sids: HashMap<Pid, Sid>,
	rights: HashMap<Uid, u32>,
}

/// The access control layer.
pub struct Acl {
	inner: Mutex<Inner>,
}

const NO_SID: Status = Status::External(0x000B_0001);

impl Acl {
	/// Creates the layer with a root SID for the boot task.
	pub fn new() -> Self {
		let mut sids = HashMap::new();
		sids.insert(
			proc1::BOOT_PID,
			Sid {
				user: Uid::generate(),
				group: Uid::generate(),
				org: Uid::generate(),
				login: Uid::generate(),
			},
		);
		Self {
			inner: Mutex::new(Inner {
				sids,
				rights: HashMap::new(),
			}),
		}
	}

	/// Sets up access state for a newly created task, inheriting the
	/// caller's SID.
	pub fn alloc_asid(&self, pid: Pid) -> KResult<()> {
		let caller = proc1::current();
		let mut inner = self.inner.lock().unwrap();
		let sid = inner.sids.get(&caller).copied().ok_or(NO_SID)?;
		inner.sids.insert(pid, sid);
		Ok(())
	}

	/// Returns the SID of a task.
	pub fn get_pid_sid(&self, pid: Pid) -> KResult<Sid> {
		self.inner
			.lock()
			.unwrap()
			.sids
			.get(&pid)
			.copied()
			.ok_or(NO_SID)
	}

	/// Overrides the SID of a task.
	pub fn set_pid_sid(&self, pid: Pid, sid: Sid) {
		self.inner.lock().unwrap().sids.insert(pid, sid);
	}

	/// Enters super mode on the calling thread. Nests.
	pub fn enter_super(&self) {
		SUPER_DEPTH.with(|d| d.set(d.get() + 1));
	}

	/// Leaves super mode on the calling thread.
	pub fn exit_super(&self) {
		SUPER_DEPTH.with(|d| {
			debug_assert!(d.get() > 0, "unbalanced exit_super");
			d.set(d.get().saturating_sub(1));
		});
	}

	/// Tells whether the calling thread is in super mode.
	pub fn in_super(&self) -> bool {
		SUPER_DEPTH.with(|d| d.get() > 0)
	}

	/// Returns the caller's rights on an object. Objects default to
	/// administrator rights until restricted.
	pub fn rights(&self, object: Uid) -> u32 {
		self.inner
			.lock()
			.unwrap()
			.rights
			.get(&object)
			.copied()
			.unwrap_or(RIGHTS_ADMIN)
	}

	/// Restricts or grants rights on an object.
	pub fn set_rights(&self, object: Uid, rights: u32) {
		self.inner.lock().unwrap().rights.insert(object, rights);
	}

	/// Tells whether the caller may deliver a fault (signal) to a task
	/// owned by `target`.
	pub fn check_fault_rights(&self, target: Pid) -> bool {
		if self.in_super() {
			return true;
		}
		let inner = self.inner.lock().unwrap();
		let caller = inner.sids.get(&proc1::current());
		let target = inner.sids.get(&target);
		match (caller, target) {
			(Some(a), Some(b)) => a.user == b.user,
			_ => false,
		}
	}

	/// Tells whether the caller may debug the target task.
	pub fn check_debug_rights(&self, target: Pid) -> bool {
		self.check_fault_rights(target)
	}
}

impl Default for Acl {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn super_mode_nests() {
		let acl = Acl::new();
		assert!(!acl.in_super());
		acl.enter_super();
		acl.enter_super();
		acl.exit_super();
		assert!(acl.in_super());
		acl.exit_super();
		assert!(!acl.in_super());
	}

	#[test]
	fn fault_rights_follow_user_uid() {
		let acl = Acl::new();
		acl.alloc_asid(7).unwrap();
		assert!(acl.check_fault_rights(7));
		let mut sid = acl.get_pid_sid(7).unwrap();
		sid.user = Uid::generate();
		acl.set_pid_sid(7, sid);
		assert!(!acl.check_fault_rights(7));
		// Super mode overrides
		acl.enter_super();
		assert!(acl.check_fault_rights(7));
		acl.exit_super();
	}

	#[test]
	fn rights_default_admin() {
		let acl = Acl::new();
		let object = Uid::generate();
		assert_eq!(acl.rights(object), RIGHTS_ADMIN);
		acl.set_rights(object, 0);
		assert_eq!(acl.rights(object), 0);
	}
}
