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

//! Process creation.
//!
//! `create` builds a process from a code descriptor; `fork` clones the
//! caller, optionally with vfork semantics where the child borrows the
//! parent's address space until it calls `complete_vfork`. Creation
//! failures unwind in strict reverse order of the setup steps so the table,
//! the free list and the per-ASID owner table are restored exactly.

use super::{Lifecycle, ProcFlags, ProcIx, Proc2, Upid};
use crate::{
	proc1,
	status::{crash_system, KResult, Status},
	time,
	uid::Uid,
};
use std::sync::Arc;

/// Entry point of a new process.
pub type TaskMain = Arc<dyn Fn(i32) + Send + Sync + 'static>;

/// Result of a successful fork.
#[derive(Clone, Copy, Debug)]
pub struct ForkReturn {
	pub uid: Uid,
	pub upid: Upid,
	/// Whether the child reached its first user instruction before the
	/// parent resumed; when false the child died during startup.
	pub completed: bool,
}

/// Result of a successful create.
#[derive(Clone, Copy, Debug)]
pub struct CreateReturn {
	pub uid: Uid,
	pub upid: Upid,
	/// Scheduler handle of the new task; the creator resumes it.
	pub pid: proc1::Pid,
}

impl Proc2 {
	/// Forks the calling process.
	///
	/// `fork_flags == 0` requests vfork semantics: the child runs on the
	/// parent's address space and holds the fresh one in reserve until
	/// [`Self::complete_vfork`]. The parent only returns once the child
	/// has either completed its startup or died trying.
	pub fn fork(
		self: &Arc<Self>,
		entry: TaskMain,
		user_data: i32,
		fork_flags: u32,
	) -> KResult<ForkReturn> {
		let parent_pid = proc1::current();
		let parent_asid = proc1::as_id();
		let vfork = fork_flags == 0;

		let mut t = self.lock();
		let parent_ix = t.pid_to_index(parent_pid);
		if parent_ix.is_none() {
			return Err(Status::UidNotFound);
		}
		let now = time::clock();
		let child = t.alloc_slot()?;
		{
			let entry = t.entry_mut(child);
			entry.flags = ProcFlags::NOTIFY_GUARDIAN;
			if vfork {
				entry.flags |= ProcFlags::VFORK | ProcFlags::ALT_ASID;
			}
		}
		let new_asid = match self.mst.alloc_asid() {
			Ok(asid) => asid,
			Err(status) => {
				return Err(self.creation_unwind(&mut t, child, parent_ix, status));
			}
		};
		{
			let parent = t.entry(parent_ix).clone();
			let entry = t.entry_mut(child);
			entry.cr_rec = parent.cr_rec;
			entry.cr_rec_2 = user_data as u32;
			if vfork {
				entry.asid = parent.asid;
				entry.asid_alt = new_asid;
				entry.tty_uid = parent.tty_uid;
			} else {
				entry.asid = new_asid;
				entry.asid_alt = 0;
			}
		}
		let (uid, upid) = t.init_entry(child);
		let child_asid = t.entry(child).asid;
		self.mst.set_asid_uid(new_asid, uid);

		let stack = match self.proc1.alloc_stack(0x1000) {
			Ok(stack) => stack,
			Err(status) => {
				return Err(self.creation_fail(&mut t, child, parent_ix, false, status));
			}
		};
		t.entry_mut(child).stack = stack;

		let runner = {
			let p2 = self.clone();
			let entry = entry.clone();
			Box::new(move || {
				p2.startup(entry, user_data);
			})
		};
		let pid = match self.proc1.bind(runner, stack, 0) {
			Ok(pid) => pid,
			Err(status) => {
				return Err(self.creation_fail(&mut t, child, parent_ix, false, status));
			}
		};
		{
			let entry = t.entry_mut(child);
			entry.pid = pid;
			entry.flags |= ProcFlags::BOUND;
			entry.lifecycle = Lifecycle::Bound;
		}
		t.pid_map[pid as usize] = child.0;

		// Signal state is copied verbatim
		let parent_sig = t.entry(parent_ix).sig;
		let parent_armed = t
			.entry(parent_ix)
			.flags
			.contains(ProcFlags::ALT_MASK_ARMED);
		{
			let entry = t.entry_mut(child);
			entry.sig = parent_sig;
			entry.flags.set(ProcFlags::ONSTACK, parent_armed);
			entry.creation_time = now.high;
		}
		t.attach_child(parent_ix, child);
		// The child starts in its parent's pgroup and session
		let parent_pg = t.entry(parent_ix).pgroup_ix;
		let parent_session = t.entry(parent_ix).session_id;
		let parent_priority = t.entry(parent_ix).priority;
		{
			let entry = t.entry_mut(child);
			entry.session_id = parent_session;
			entry.priority = parent_priority;
		}
		if parent_pg != 0 {
			t.pgroups[parent_pg as usize].ref_count += 1;
			t.entry_mut(child).pgroup_ix = parent_pg;
		}
		self.fork_ec(child).init(-1);
		self.cr_ec(child).init(0);
		let parent_debugger = t.entry(parent_ix).debugger;
		drop(t);

		let _ = self.acl.alloc_asid(pid);
		if let Some(audit) = self.audit() {
			audit.inherit(parent_pid, pid);
		}
		self.fim.copy_user_fim_addr(parent_asid, child_asid);

		let mut file_locked = false;
		if !vfork {
			let subsystems = (|| -> KResult<()> {
				if parent_pid != proc1::BOOT_PID {
					self.names.fork_lock(child_asid)?;
					file_locked = true;
				}
				self.mst.fork(child_asid, pid, fork_flags)?;
				let cr_rec = {
					let t = self.lock();
					(t.entry(child).cr_rec, t.entry(child).cr_rec_2)
				};
				self.mst.get_va_info(child_asid, cr_rec.0)?;
				self.mst.get_va_info(child_asid, cr_rec.1.wrapping_sub(1))?;
				self.names.fork(parent_asid, child_asid)?;
				Ok(())
			})();
			if let Err(status) = subsystems {
				let mut t = self.lock();
				if file_locked {
					self.names.priv_unlock_all(child_asid);
				}
				return Err(self.creation_fail(&mut t, child, parent_ix, true, status));
			}
		}

		let (mut min, mut max) = if parent_pid == proc1::BOOT_PID {
			(3, 14)
		} else {
			let mut min = 0;
			let mut max = 0;
			self.proc1.set_priority(parent_pid, 0, &mut min, &mut max);
			(min, max)
		};
		if !parent_debugger.is_none() && self.xpd.inherit_ptrace_options() {
			let mut t = self.lock();
			self.debug_setup_locked(&mut t, child, parent_debugger, false);
			let opts = t.entry(parent_ix).ptrace;
			t.entry_mut(child).ptrace = opts;
		}
		self.proc1.set_priority(pid, 0xFF00, &mut min, &mut max);
		self.proc1.set_type(pid, 2);
		// The trigger must predate the resume or the wakeup is lost
		let trigger = self.fork_ec(child).read() + 1;
		if self.proc1.resume(pid).is_err() {
			crash_system(Status::InternalError);
		}
		// Sleep until the child finishes (or abandons) its startup
		self.fork_ec(child).wait(trigger);

		let t = self.lock();
		let entry = t.entry(child);
		// A zombie that still holds the spare ASID died before completing
		// its vfork
		let completed = match entry.lifecycle {
			Lifecycle::Valid => true,
			Lifecycle::Zombie => !entry.flags.contains(ProcFlags::ALT_ASID),
			_ => false,
		};
		Ok(ForkReturn {
			uid,
			upid,
			completed,
		})
	}

	/// Creates a process from a code descriptor.
	///
	/// The task is bound but left suspended; the creator resumes it. With
	/// the server flag (bit 7 of `flags`) the process starts detached from
	/// the hierarchy.
	pub fn create(
		self: &Arc<Self>,
		parent_uid: Uid,
		code_desc: u32,
		map_param: u32,
		entry: TaskMain,
		user_data: i32,
		flags: u8,
	) -> KResult<CreateReturn> {
		let creator_pid = proc1::current();
		let mut t = self.lock();
		let creator_ix = t.pid_to_index(creator_pid);
		let now = time::clock();
		let child = t.alloc_slot()?;

		let new_asid = match self.mst.alloc_asid() {
			Ok(asid) => asid,
			Err(status) => {
				return Err(self.creation_unwind(&mut t, child, creator_ix, status));
			}
		};
		self.fim.fp_init(new_asid);
		{
			let entry = t.entry_mut(child);
			entry.asid = new_asid;
			entry.asid_alt = 0;
			entry.flags = ProcFlags::empty();
			if flags & 0x80 != 0 {
				entry.flags |= ProcFlags::SERVER;
			}
		}
		let (uid, upid) = t.init_entry(child);
		self.mst.set_asid_uid(new_asid, uid);
		{
			let entry = t.entry_mut(child);
			entry.cr_rec = code_desc;
			entry.cr_rec_2 = user_data as u32;
			entry.tty_uid = Uid::NIL;
			entry.creation_time = now.high;
		}
		if let Err(status) =
			self.mst
				.map_initial_area(code_desc, new_asid, &parent_uid, map_param, 0x70000)
		{
			return Err(self.creation_fail(&mut t, child, creator_ix, false, status));
		}
		let stack = match self.proc1.alloc_stack(0x1000) {
			Ok(stack) => stack,
			Err(status) => {
				return Err(self.creation_fail(&mut t, child, creator_ix, false, status));
			}
		};
		t.entry_mut(child).stack = stack;
		let runner = {
			let p2 = self.clone();
			let entry = entry.clone();
			Box::new(move || {
				p2.startup(entry, user_data);
			})
		};
		let pid = match self.proc1.bind(runner, stack, 0) {
			Ok(pid) => pid,
			Err(status) => {
				return Err(self.creation_fail(&mut t, child, creator_ix, false, status));
			}
		};
		{
			let entry = t.entry_mut(child);
			entry.pid = pid;
			entry.flags |= ProcFlags::BOUND;
			entry.lifecycle = Lifecycle::Bound;
		}
		t.pid_map[pid as usize] = child.0;
		// Server processes start outside the hierarchy
		if flags & 0x80 != 0 {
			t.entry_mut(child).flags |= ProcFlags::ORPHAN;
		} else if !creator_ix.is_none() {
			t.attach_child(creator_ix, child);
			// Ptrace options follow the parent when the debugger allows it
			let creator_debugger = t.entry(creator_ix).debugger;
			if !creator_debugger.is_none() && self.xpd.inherit_ptrace_options() {
				self.debug_setup_locked(&mut t, child, creator_debugger, false);
				let opts = t.entry(creator_ix).ptrace;
				t.entry_mut(child).ptrace = opts;
			}
		} else {
			t.entry_mut(child).flags |= ProcFlags::ORPHAN;
		}
		self.fork_ec(child).init(0);
		self.cr_ec(child).init(0);
		drop(t);

		let _ = self.acl.alloc_asid(pid);
		if let Some(audit) = self.audit() {
			audit.inherit(creator_pid, pid);
		}
		if let Err(status) = self.names.init_asid(new_asid) {
			let mut t = self.lock();
			return Err(self.creation_fail(&mut t, child, creator_ix, true, status));
		}
		let (mut min, mut max) = if creator_pid == proc1::BOOT_PID {
			(3, 14)
		} else {
			let mut min = 0;
			let mut max = 0;
			self.proc1.set_priority(creator_pid, 0, &mut min, &mut max);
			(min, max)
		};
		self.proc1.set_priority(pid, 0xFF0A, &mut min, &mut max);
		self.proc1.set_type(pid, 2);
		Ok(CreateReturn {
			uid,
			upid,
			pid,
		})
	}

	/// Startup of a freshly bound process: installs its address space,
	/// marks it valid, releases a waiting fork parent, runs the program,
	/// and exits with status 0 when the program returns.
	fn startup(self: &Arc<Self>, entry: TaskMain, user_data: i32) {
		let pid = proc1::current();
		let (ix, asid, vfork) = {
			let t = self.lock();
			let ix = t.pid_to_index(pid);
			if ix.is_none() {
				return;
			}
			let e = t.entry(ix);
			(ix, e.asid, e.flags.contains(ProcFlags::ALT_ASID))
		};
		proc1::set_as_id(asid);
		self.set_valid();
		if !vfork {
			self.fork_ec(ix).advance();
		}
		entry(user_data);
		self.exit(0);
	}

	/// Marks the calling process as having reached its first user
	/// instruction, mapping its stack area on the way when none is bound.
	pub fn set_valid(&self) {
		let mut t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			return;
		}
		if t.entry(ix).tty_uid.is_nil() {
			let desc = t.entry(ix).cr_rec_2;
			let asid = t.entry(ix).asid;
			if self.mst.map_area_at(asid, desc).is_err() {
				drop(t);
				self.exit(0);
				return;
			}
		}
		t.entry_mut(ix).lifecycle = Lifecycle::Valid;
	}

	/// Completes a vfork in the child: swaps to the reserved address
	/// space, gives the parent its space back, wakes it, and runs the new
	/// program image.
	///
	/// Only returns an error before the address-space switch; failures
	/// after it terminate the process.
	pub fn complete_vfork(
		self: &Arc<Self>,
		proc_uid: Uid,
		code_desc: u32,
		map_param: u32,
		entry: TaskMain,
		user_data: i32,
	) -> KResult<()> {
		let (ix, new_asid, stack_desc) = {
			let mut t = self.lock();
			let ix = t.current_index();
			if ix.is_none() {
				return Err(Status::UidNotFound);
			}
			if !t.entry(ix).flags.contains(ProcFlags::ALT_ASID) {
				return Err(Status::ProcessWasntVforked);
			}
			let (old_asid, new_asid) = {
				let e = t.entry_mut(ix);
				let old = e.asid;
				let new = e.asid_alt;
				e.asid = new;
				e.asid_alt = 0;
				e.cr_rec_2 = user_data as u32;
				if !proc_uid.is_nil() {
					e.uid = proc_uid;
				}
				e.flags.remove(ProcFlags::VFORK);
				(old, new)
			};
			let child_uid = t.entry(ix).uid;
			self.mst.set_asid_uid(new_asid, child_uid);
			// The parent's space reverts to the parent's identity
			let parent = t.entry(ix).parent;
			let owner = if parent.is_none() {
				self.system_uid
			} else {
				t.entry(parent).uid
			};
			self.mst.set_asid_uid(old_asid, owner);
			self.fim.fp_init(new_asid);
			self.fim.copy_user_fim_addr(old_asid, new_asid);
			if let Err(status) =
				self.mst
					.map_initial_area(code_desc, new_asid, &child_uid, map_param, 0x07FF_00E7)
			{
				// Undo the swap so the exit path frees the right space
				let e = t.entry_mut(ix);
				e.asid = old_asid;
				e.asid_alt = new_asid;
				drop(t);
				self.exit(0);
				return Err(status.external());
			}
			t.entry_mut(ix).tty_uid = Uid::NIL;
			if let Err(status) = self.names.init_asid(new_asid) {
				let e = t.entry_mut(ix);
				e.asid = old_asid;
				e.asid_alt = new_asid;
				drop(t);
				self.exit(0);
				return Err(status.external());
			}
			t.entry_mut(ix).flags.remove(ProcFlags::ALT_ASID);
			// Wakes the parent blocked in fork
			self.fork_ec(ix).advance();
			proc1::set_as_id(new_asid);
			(ix, new_asid, t.entry(ix).cr_rec_2)
		};
		let _ = ix;
		if self.mst.map_area_at(new_asid, stack_desc).is_err() {
			self.exit(0);
			return Err(Status::External(0x0004_0003));
		}
		entry(user_data);
		Ok(())
	}

	/// Terminates the calling process with the given exit code.
	///
	/// Live children are orphaned and unreaped zombies freed. An already
	/// orphaned process vanishes directly; otherwise the entry turns
	/// zombie on its parent's zombie list and the guardian is woken.
	pub fn exit(&self, code: u32) {
		let pid = proc1::current();
		let mut t = self.lock();
		let ix = t.pid_to_index(pid);
		if ix.is_none() || t.entry(ix).lifecycle == Lifecycle::Zombie {
			return;
		}
		let (asid, asid_alt, alt, traced) = {
			let e = t.entry(ix);
			(
				e.asid,
				e.asid_alt,
				e.flags.contains(ProcFlags::ALT_ASID),
				!e.debugger.is_none(),
			)
		};
		self.fim.drain_cleanup(asid);
		{
			let e = t.entry_mut(ix);
			e.exit_status[0] = (code & 0xFF) << 8;
			if traced {
				e.flags |= ProcFlags::ORPHAN;
			}
		}
		// Release every process this one was debugging
		loop {
			let target = t.entry(ix).first_debug_target;
			if target.is_none() {
				break;
			}
			self.debug_clear_locked(&mut t, target, false);
		}
		// Leader counts adjust while the hierarchy is still intact; an
		// orphaned group learns of it here
		self.pgroup_cleanup(&mut t, ix, super::pgroup::CleanupMode::LeaderCounts);
		// Orphan live children, free unreaped zombies
		loop {
			let child = t.entry(ix).first_child;
			if child.is_none() {
				break;
			}
			self.detach_from_parent(&mut t, child, ProcIx::NONE);
		}
		loop {
			let zombie = t.entry(ix).first_zombie;
			if zombie.is_none() {
				break;
			}
			t.entry_mut(ix).first_zombie = t.entry(zombie).next_zombie;
			self.pgroup_cleanup(&mut t, zombie, super::pgroup::CleanupMode::Refcount);
			t.unlink_alloc(zombie);
			t.free_slot(zombie);
		}
		t.pid_map[pid as usize] = 0;

		let parent = t.entry(ix).parent;
		if parent.is_none() {
			// An orphan never reaches a zombie list
			self.debug_unlink_locked(&mut t, ix);
			self.pgroup_cleanup(&mut t, ix, super::pgroup::CleanupMode::Refcount);
			t.unlink_alloc(ix);
			t.free_slot(ix);
		} else {
			let prev = t
				.find_prev_sibling(parent, ix)
				.unwrap_or(ProcIx::NONE);
			let next = t.entry(ix).next_sibling;
			if prev.is_none() {
				t.entry_mut(parent).first_child = next;
			} else {
				t.entry_mut(prev).next_sibling = next;
			}
			let zombie_head = t.entry(parent).first_zombie;
			{
				let e = t.entry_mut(ix);
				e.next_sibling = ProcIx::NONE;
				e.next_zombie = zombie_head;
				e.lifecycle = Lifecycle::Zombie;
			}
			t.entry_mut(parent).first_zombie = ix;
			self.awaken_guardian(&t, ix);
		}
		if alt {
			let _ = self.mst.free_asid(asid_alt);
			// A parent blocked in fork must not wait on a dead child
			self.fork_ec(ix).advance();
		} else {
			let _ = self.mst.free_asid(asid);
			self.mst.set_asid_uid(asid, self.system_uid);
		}
		drop(t);
		let _ = self.proc1.unbind(pid);
	}

	/// Unwinds a failed creation from the point where only the slot and
	/// its list links exist.
	fn creation_unwind(
		&self,
		t: &mut super::Tables,
		child: ProcIx,
		_parent: ProcIx,
		status: Status,
	) -> Status {
		self.pgroup_cleanup(t, child, super::pgroup::CleanupMode::Both);
		t.unlink_alloc(child);
		t.free_slot(child);
		status.external()
	}

	/// Unwinds a failed creation in strict reverse order of the prelude:
	/// parent link, task or stack, address space, pgroup, slot.
	fn creation_fail(
		&self,
		t: &mut super::Tables,
		child: ProcIx,
		parent: ProcIx,
		_relock: bool,
		status: Status,
	) -> Status {
		// Drop the parent link
		if !parent.is_none() && t.entry(child).parent == parent {
			if let Ok(prev) = t.find_prev_sibling(parent, child) {
				let next = t.entry(child).next_sibling;
				if prev.is_none() {
					t.entry_mut(parent).first_child = next;
				} else {
					t.entry_mut(prev).next_sibling = next;
				}
				t.entry_mut(child).parent = ProcIx::NONE;
			}
		}
		// Unbind the task or free the bare stack
		let entry = t.entry(child).clone();
		if entry.flags.contains(ProcFlags::BOUND) {
			t.pid_map[entry.pid as usize] = 0;
			let _ = self.proc1.unbind(entry.pid);
		} else if entry.stack != 0 {
			self.proc1.free_stack(entry.stack);
		}
		// Release the address space, restoring the owner table
		if entry.flags.contains(ProcFlags::ALT_ASID) {
			let _ = self.mst.free_asid(entry.asid_alt);
			let owner = if parent.is_none() {
				self.system_uid
			} else {
				t.entry(parent).uid
			};
			self.mst.set_asid_uid(entry.asid, owner);
		} else {
			let _ = self.mst.free_asid(entry.asid);
			self.mst.set_asid_uid(entry.asid, self.system_uid);
		}
		self.fim.drain_cleanup(entry.asid);
		self.creation_unwind(t, child, parent, status)
	}
}

#[cfg(test)]
mod test {
	use super::super::test::proc2;
	use super::*;

	#[test]
	fn creation_failure_restores_table() {
		let p2 = Arc::new(proc2());
		// Exhaust the ASID space so fork fails past the slot allocation
		let mut held = Vec::new();
		while let Ok(asid) = p2.mst.alloc_asid() {
			held.push(asid);
		}
		let free_before = {
			let t = p2.lock();
			let mut n = 0;
			let mut cur = t.free_head;
			while !cur.is_none() {
				n += 1;
				cur = t.entry(cur).next_free;
			}
			n
		};
		let err = p2
			.fork(Arc::new(|_| {}), 0, 1)
			.expect_err("fork must fail without ASIDs");
		assert!(matches!(err, Status::External(_)));
		let free_after = {
			let t = p2.lock();
			let mut n = 0;
			let mut cur = t.free_head;
			while !cur.is_none() {
				n += 1;
				cur = t.entry(cur).next_free;
			}
			n
		};
		assert_eq!(free_before, free_after);
		for asid in held {
			let _ = p2.mst.free_asid(asid);
		}
	}
}
