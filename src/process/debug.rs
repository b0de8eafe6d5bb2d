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

//! Debugger attachment.
//!
//! A debugger owns a list of targets chained through their entries. A
//! target points back at its debugger; attaching always detaches from any
//! previous debugger first.

use super::{Lifecycle, ProcFlags, ProcIx, Proc2, Tables, Upid};
use crate::{
	status::{KResult, Status},
	uid::Uid,
};

impl Proc2 {
	/// Removes the process from its debugger's target list.
	pub(crate) fn debug_unlink_locked(&self, t: &mut Tables, ix: ProcIx) {
		let debugger = t.entry(ix).debugger;
		if debugger.is_none() {
			return;
		}
		let mut cur = t.entry(debugger).first_debug_target;
		if cur == ix {
			t.entry_mut(debugger).first_debug_target = t.entry(ix).next_debug_target;
		} else {
			while !cur.is_none() {
				let next = t.entry(cur).next_debug_target;
				if next == ix {
					t.entry_mut(cur).next_debug_target = t.entry(ix).next_debug_target;
					break;
				}
				cur = next;
			}
		}
		let entry = t.entry_mut(ix);
		entry.debugger = ProcIx::NONE;
		entry.next_debug_target = ProcIx::NONE;
	}

	/// Attaches `debugger` to `target`, detaching any previous debugger,
	/// resetting the target's ptrace options, and optionally seeding its
	/// debug state through XPD.
	pub(crate) fn debug_setup_locked(
		&self,
		t: &mut Tables,
		target: ProcIx,
		debugger: ProcIx,
		write: bool,
	) {
		if !t.entry(target).debugger.is_none() {
			self.debug_unlink_locked(t, target);
		}
		let head = t.entry(debugger).first_debug_target;
		{
			let entry = t.entry_mut(target);
			entry.debugger = debugger;
			entry.next_debug_target = head;
		}
		t.entry_mut(debugger).first_debug_target = target;
		if t.entry(target).flags.contains(ProcFlags::NOTIFY_GUARDIAN) {
			self.awaken_guardian(t, target);
		}
		let mut opts = t.entry(target).ptrace;
		self.xpd.reset_ptrace_opts(&mut opts);
		t.entry_mut(target).ptrace = opts;
		if write {
			let offset = t.entry(target).cr_rec_2.wrapping_add(0x90);
			let _ = self.xpd.write(target.0 as u32, offset);
		}
		if t.entry(target).flags.contains(ProcFlags::NOTIFY_GUARDIAN) {
			self.awaken_guardian(t, target);
		}
	}

	/// Clears the debug relation of a process. A zombie just has its
	/// guardian woken; a live target is optionally scrubbed through XPD and
	/// resumed.
	pub(crate) fn debug_clear_locked(&self, t: &mut Tables, ix: ProcIx, write: bool) {
		if t.entry(ix).debugger.is_none() {
			return;
		}
		self.debug_unlink_locked(t, ix);
		t.entry_mut(ix).flags.remove(ProcFlags::NOTIFY_GUARDIAN);
		if t.entry(ix).lifecycle == Lifecycle::Zombie {
			self.awaken_guardian(t, ix);
			return;
		}
		if write {
			let offset = t.entry(ix).cr_rec_2.wrapping_add(0x90);
			let _ = self.xpd.write(ix.0 as u32, offset);
			t.entry_mut(ix).flags.remove(ProcFlags::NOTIFY_GUARDIAN);
			let _ = self.proc1.resume(t.entry(ix).pid);
		}
	}

	/// Attaches the caller as debugger of the process named by `uid`.
	///
	/// A target already under a debugger is refused; `override_debug`
	/// exists for that.
	pub fn debug(&self, uid: Uid) -> KResult<()> {
		let mut t = self.lock();
		let target = t.find_by_uid(uid).map_err(|(status, _)| status)?;
		if !t.entry(target).debugger.is_none() {
			return Err(Status::PermissionDenied);
		}
		if !self.acl.check_debug_rights(t.entry(target).pid) {
			return Err(Status::PermissionDenied);
		}
		let debugger = t.current_index();
		if debugger.is_none() {
			return Err(Status::UidNotFound);
		}
		self.debug_setup_locked(&mut t, target, debugger, true);
		Ok(())
	}

	/// Attaches the caller as debugger of the target, regardless of any
	/// existing debugger. A NIL `uid` re-arms debugging of the caller's
	/// parent by the parent's own debugger.
	pub fn override_debug(&self, uid: Uid) -> KResult<()> {
		let mut t = self.lock();
		if uid.is_nil() {
			let cur = t.current_index();
			if cur.is_none() {
				return Err(Status::UidNotFound);
			}
			let target = t.entry(cur).parent;
			if target.is_none() {
				return Err(Status::UidNotFound);
			}
			let debugger = t.entry(target).parent;
			if debugger.is_none() {
				return Err(Status::UidNotFound);
			}
			self.debug_setup_locked(&mut t, target, debugger, false);
			return Ok(());
		}
		let target = t.find_by_uid(uid).map_err(|(status, _)| status)?;
		if !self.acl.check_debug_rights(t.entry(target).pid) {
			return Err(Status::PermissionDenied);
		}
		let debugger = t.current_index();
		if debugger.is_none() {
			return Err(Status::UidNotFound);
		}
		self.debug_setup_locked(&mut t, target, debugger, true);
		Ok(())
	}

	/// Detaches the caller from a target it debugs.
	pub fn undebug(&self, uid: Uid) -> KResult<()> {
		let mut t = self.lock();
		let target = match t.find_by_uid(uid) {
			Ok(ix) => ix,
			Err((Status::Zombie, ix)) => ix,
			Err((status, _)) => return Err(status),
		};
		if t.entry(target).debugger != t.current_index() {
			return Err(Status::ProcNotDebugTarget);
		}
		self.debug_clear_locked(&mut t, target, true);
		Ok(())
	}

	/// Returns the UPID of the target's debugger.
	pub fn get_debugger_pid(&self, uid: Uid) -> KResult<Upid> {
		let t = self.lock();
		let target = match t.find_by_uid(uid) {
			Ok(ix) => ix,
			Err((Status::Zombie, ix)) => ix,
			Err((status, _)) => return Err(status),
		};
		let debugger = t.entry(target).debugger;
		if debugger.is_none() {
			return Err(Status::ProcNotDebugTarget);
		}
		Ok(t.entry(debugger).upid)
	}
}

#[cfg(test)]
mod test {
	use super::super::test::proc2;
	use super::*;

	fn slot(p2: &Proc2) -> ProcIx {
		let mut t = p2.lock();
		let ix = t.alloc_slot().unwrap();
		t.init_entry(ix);
		t.entry_mut(ix).lifecycle = Lifecycle::Valid;
		ix
	}

	#[test]
	fn attach_detach_roundtrip() {
		let p2 = proc2();
		let a = slot(&p2);
		let b = slot(&p2);
		let dbg = slot(&p2);
		let mut t = p2.lock();
		p2.debug_setup_locked(&mut t, a, dbg, false);
		p2.debug_setup_locked(&mut t, b, dbg, false);
		assert_eq!(t.entry(dbg).first_debug_target, b);
		assert_eq!(t.entry(b).next_debug_target, a);
		assert_eq!(t.entry(a).debugger, dbg);
		// A target appears exactly once in its debugger's list
		let mut count = 0;
		let mut cur = t.entry(dbg).first_debug_target;
		while !cur.is_none() {
			if cur == a {
				count += 1;
			}
			cur = t.entry(cur).next_debug_target;
		}
		assert_eq!(count, 1);
		p2.debug_clear_locked(&mut t, a, false);
		assert!(t.entry(a).debugger.is_none());
		assert_eq!(t.entry(dbg).first_debug_target, b);
		p2.debug_clear_locked(&mut t, b, false);
		assert!(t.entry(dbg).first_debug_target.is_none());
	}

	#[test]
	fn reattach_moves_between_debuggers() {
		let p2 = proc2();
		let target = slot(&p2);
		let dbg1 = slot(&p2);
		let dbg2 = slot(&p2);
		let mut t = p2.lock();
		p2.debug_setup_locked(&mut t, target, dbg1, false);
		p2.debug_setup_locked(&mut t, target, dbg2, false);
		assert!(t.entry(dbg1).first_debug_target.is_none());
		assert_eq!(t.entry(dbg2).first_debug_target, target);
		assert_eq!(t.entry(target).debugger, dbg2);
	}
}
