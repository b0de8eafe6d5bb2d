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

//! High-level process management.
//!
//! The process table is a fixed arena of entries cross-referenced by index;
//! slot 0 is reserved as "none" so a zero index always means the absence of
//! a link. Every entry is on exactly one of the free list or the allocated
//! list. Parent/child, sibling, zombie and debugger relations are chains of
//! indices inside the entries themselves.
//!
//! All table state lives behind one lock. Public operations acquire it on
//! entry and release it on every exit path; the only waits taken inside an
//! operation happen after the lock is dropped.

pub mod debug;
pub mod fork;
pub mod pgroup;
pub mod signal;
pub mod wait;

use crate::{
	acl::Acl,
	audit::Audit,
	ec::Eventcount,
	fim::Fim,
	mst::{Asid, Mst},
	name::Names,
	proc1,
	proc1::{Pid, Proc1, MAX_TASKS},
	status::{KResult, Status},
	uid::Uid,
	xpd::{PtraceOpts, Xpd},
};
use pgroup::PgroupEntry;
use signal::SigState;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// A Unix-style process ID.
pub type Upid = u16;
/// A Unix-style process group ID.
pub type Upgid = u16;

/// Number of process table slots, slot 0 included.
pub const N_SLOTS: usize = 70;
/// First slot handed out by the allocator.
const FIRST_FREE: u16 = 2;
/// Lowest UPID handed out to ordinary processes.
const FIRST_UPID: Upid = 65;
/// Highest UPID handed out.
const LAST_UPID: Upid = 30000;

/// A 1-based index into the process table. Zero is "none".
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ProcIx(pub u16);

impl ProcIx {
	/// The absent link.
	pub const NONE: Self = Self(0);

	/// Index of the init process.
	pub const INIT: Self = Self(1);

	pub fn is_none(self) -> bool {
		self.0 == 0
	}

	fn idx(self) -> usize {
		self.0 as usize
	}
}

bitflags::bitflags! {
	/// Mode bits of a process entry, orthogonal to its lifecycle.
	#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
	pub struct ProcFlags: u16 {
		/// The entry is bound to a scheduler task.
		const BOUND = 0x0001;
		/// A SIGHUP was raised while blocked at the action level.
		const SIGHUP_PENDING = 0x0002;
		/// The signal handler runs on the alternate stack.
		const ONSTACK = 0x0004;
		/// The process was created with vfork semantics.
		const VFORK = 0x0008;
		/// State changes wake the guardian.
		const NOTIFY_GUARDIAN = 0x0010;
		/// The last stop was already reported to the parent.
		const REPORTED = 0x0020;
		/// The process is a session leader.
		const SESSION_LEADER = 0x0040;
		/// The process is a server process.
		const SERVER = 0x0100;
		/// A zombie child awaits collection at the caller's priority.
		const REAP_PENDING = 0x0200;
		/// An alternate signal mask is armed (sigpause).
		const ALT_MASK_ARMED = 0x0400;
		/// The process runs on its parent's address space; the spare is in
		/// `asid_alt` until `complete_vfork`.
		const ALT_ASID = 0x0800;
		/// The process is stopped inside fault handling.
		const FAULT_MODE = 0x1000;
		/// The process is suspended by a stop signal.
		const SUSPENDED = 0x4000;
		/// The process has no parent. On a zombie the same bit marks it as
		/// traced, selecting the full reap path.
		const ORPHAN = 0x8000;
	}
}

/// Lifecycle of a process table slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Lifecycle {
	/// On the free list.
	#[default]
	Free,
	/// Popped from the free list, not yet bound to a task.
	Allocated,
	/// Bound to a scheduler task.
	Bound,
	/// Executed its first user instruction.
	Valid,
	/// Exited, waiting to be reaped.
	Zombie,
}

/// A process table entry.
#[derive(Clone, Debug, Default)]
pub struct ProcEntry {
	pub uid: Uid,
	pub upid: Upid,
	pub parent_upid: Upid,
	pub asid: Asid,
	/// Spare ASID of a vforked child.
	pub asid_alt: Asid,
	/// Scheduler task handle.
	pub pid: Pid,

	pub lifecycle: Lifecycle,
	pub flags: ProcFlags,

	// Allocated/free list links
	pub next_alloc: ProcIx,
	pub prev_alloc: ProcIx,
	pub next_free: ProcIx,

	// Hierarchy links
	pub parent: ProcIx,
	pub first_child: ProcIx,
	pub next_sibling: ProcIx,
	pub first_zombie: ProcIx,
	pub next_zombie: ProcIx,

	// Debug links
	pub debugger: ProcIx,
	pub first_debug_target: ProcIx,
	pub next_debug_target: ProcIx,

	/// Index into the pgroup table, 0 for none.
	pub pgroup_ix: u16,
	pub session_id: u16,
	/// Wait-level priority; `wait` only matches children at the caller's.
	pub priority: i16,

	pub sig: SigState,

	/// Code descriptor of the creation record.
	pub cr_rec: u32,
	/// Stack context of the creation record.
	pub cr_rec_2: u32,
	pub tty_uid: Uid,
	pub creation_time: u32,

	// Exit/wait block
	pub exit_status: [u32; 2],
	pub rusage: [u32; 5],
	pub acct: [u32; 14],

	pub ptrace: PtraceOpts,
	/// Task stack handle, kept for the creation failure paths.
	pub stack: u32,
}

/// The PROC2 tables, guarded by the PROC2 lock.
pub(crate) struct Tables {
	pub slots: Vec<ProcEntry>,
	pub alloc_head: ProcIx,
	pub free_head: ProcIx,
	/// Scheduler PID to table index.
	pub pid_map: [u16; MAX_TASKS],
	pub pgroups: Vec<PgroupEntry>,
	next_upid: Upid,
}

impl Tables {
	pub fn entry(&self, ix: ProcIx) -> &ProcEntry {
		&self.slots[ix.idx()]
	}

	pub fn entry_mut(&mut self, ix: ProcIx) -> &mut ProcEntry {
		&mut self.slots[ix.idx()]
	}

	/// Pops the free-list head and splices it onto the allocated list.
	pub fn alloc_slot(&mut self) -> KResult<ProcIx> {
		let ix = self.free_head;
		if ix.is_none() {
			return Err(Status::TableFull);
		}
		self.free_head = self.entry(ix).next_free;
		let old_head = self.alloc_head;
		self.alloc_head = ix;
		let entry = self.entry_mut(ix);
		entry.next_alloc = old_head;
		entry.prev_alloc = ProcIx::NONE;
		entry.next_free = ProcIx::NONE;
		entry.lifecycle = Lifecycle::Allocated;
		if !old_head.is_none() {
			self.entry_mut(old_head).prev_alloc = ix;
		}
		Ok(ix)
	}

	/// Unlinks the entry from the allocated list.
	pub fn unlink_alloc(&mut self, ix: ProcIx) {
		let (prev, next) = {
			let entry = self.entry(ix);
			(entry.prev_alloc, entry.next_alloc)
		};
		if prev.is_none() {
			self.alloc_head = next;
		} else {
			self.entry_mut(prev).next_alloc = next;
		}
		if !next.is_none() {
			self.entry_mut(next).prev_alloc = prev;
		}
	}

	/// Returns the entry to the free list and clears its UID.
	pub fn free_slot(&mut self, ix: ProcIx) {
		let head = self.free_head;
		self.free_head = ix;
		let entry = self.entry_mut(ix);
		entry.next_free = head;
		entry.next_alloc = ProcIx::NONE;
		entry.prev_alloc = ProcIx::NONE;
		entry.lifecycle = Lifecycle::Free;
		entry.flags = ProcFlags::empty();
		entry.uid = Uid::NIL;
	}

	/// Assigns a fresh UID and UPID and clears the signal and graph state.
	pub fn init_entry(&mut self, ix: ProcIx) -> (Uid, Upid) {
		let upid = self.next_upid();
		let uid = Uid::generate();
		let entry = self.entry_mut(ix);
		entry.uid = uid;
		entry.upid = upid;
		entry.parent_upid = 0;
		entry.sig = SigState::default();
		entry.parent = ProcIx::NONE;
		entry.first_child = ProcIx::NONE;
		entry.next_sibling = ProcIx::NONE;
		entry.first_zombie = ProcIx::NONE;
		entry.next_zombie = ProcIx::NONE;
		entry.debugger = ProcIx::NONE;
		entry.first_debug_target = ProcIx::NONE;
		entry.next_debug_target = ProcIx::NONE;
		entry.pgroup_ix = 0;
		entry.session_id = 0;
		entry.priority = 0;
		entry.exit_status = [0; 2];
		entry.rusage = [0; 5];
		entry.acct = [0; 14];
		entry.ptrace = PtraceOpts::default();
		entry.pid = 0;
		entry.stack = 0;
		(uid, upid)
	}

	fn next_upid(&mut self) -> Upid {
		// UPIDs cycle through 65..=30000, skipping values still in use
		loop {
			let upid = self.next_upid;
			self.next_upid = if upid >= LAST_UPID {
				FIRST_UPID
			} else {
				upid + 1
			};
			let in_use = self.iter_alloc().any(|ix| self.entry(ix).upid == upid);
			if !in_use {
				return upid;
			}
		}
	}

	/// Iterates the allocated list.
	pub fn iter_alloc(&self) -> AllocIter<'_> {
		AllocIter {
			tables: self,
			cur: self.alloc_head,
		}
	}

	/// Looks up an allocated entry by UID.
	///
	/// A zombie reports [`Status::Zombie`] alongside its index; callers that
	/// tolerate zombies match on it.
	pub fn find_by_uid(&self, uid: Uid) -> Result<ProcIx, (Status, ProcIx)> {
		for ix in self.iter_alloc() {
			let entry = self.entry(ix);
			if entry.uid == uid {
				if entry.lifecycle == Lifecycle::Zombie {
					return Err((Status::Zombie, ix));
				}
				return Ok(ix);
			}
		}
		Err((Status::UidNotFound, ProcIx::NONE))
	}

	/// Looks up an allocated entry by UPID.
	pub fn find_by_upid(&self, upid: Upid) -> Result<ProcIx, (Status, ProcIx)> {
		for ix in self.iter_alloc() {
			let entry = self.entry(ix);
			if entry.upid == upid {
				if entry.lifecycle == Lifecycle::Zombie {
					return Err((Status::Zombie, ix));
				}
				return Ok(ix);
			}
		}
		Err((Status::UidNotFound, ProcIx::NONE))
	}

	/// Maps a scheduler PID to its table index.
	pub fn pid_to_index(&self, pid: Pid) -> ProcIx {
		ProcIx(self.pid_map[pid as usize])
	}

	/// Index of the calling context's entry.
	pub fn current_index(&self) -> ProcIx {
		self.pid_to_index(proc1::current())
	}

	/// Finds the sibling preceding `child` in `parent`'s child list.
	///
	/// Returns `NONE` when the child is the list head.
	pub fn find_prev_sibling(&self, parent: ProcIx, child: ProcIx) -> KResult<ProcIx> {
		let mut cur = self.entry(parent).first_child;
		if cur == child {
			return Ok(ProcIx::NONE);
		}
		while !cur.is_none() {
			let next = self.entry(cur).next_sibling;
			if next == child {
				return Ok(cur);
			}
			cur = next;
		}
		Err(Status::InternalError)
	}

	/// Splices a child at the head of the parent's child list.
	pub fn attach_child(&mut self, parent: ProcIx, child: ProcIx) {
		let head = self.entry(parent).first_child;
		let parent_upid = self.entry(parent).upid;
		let entry = self.entry_mut(child);
		entry.parent = parent;
		entry.next_sibling = head;
		entry.parent_upid = parent_upid;
		self.entry_mut(parent).first_child = child;
	}
}

/// Iterator over the allocated list.
pub struct AllocIter<'t> {
	tables: &'t Tables,
	cur: ProcIx,
}

impl Iterator for AllocIter<'_> {
	type Item = ProcIx;

	fn next(&mut self) -> Option<ProcIx> {
		if self.cur.is_none() {
			return None;
		}
		let ix = self.cur;
		self.cur = self.tables.entry(ix).next_alloc;
		Some(ix)
	}
}

/// A read-only snapshot of one process, for inspection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcInfo {
	pub uid: Uid,
	pub upid: Upid,
	pub parent_upid: Upid,
	pub upgid: Upgid,
	pub session_id: u16,
	pub asid: Asid,
	/// Scheduler handle of the process's task.
	pub pid: Pid,
	pub lifecycle: Lifecycle,
	pub flags: ProcFlags,
	/// Raised-but-undelivered signal set.
	pub pending: u32,
	/// Blocked signal set.
	pub blocked: u32,
}

/// The high-level process manager.
pub struct Proc2 {
	inner: Mutex<Tables>,
	/// Per-slot fork eventcounts; a forking parent waits here for its child.
	fork_ecs: Vec<Eventcount>,
	/// Per-slot creation-record eventcounts; `wait` sleeps here.
	cr_ecs: Vec<Eventcount>,
	/// UID of the PROC2 subsystem itself; free ASIDs map back to it.
	pub system_uid: Uid,

	pub(crate) proc1: Arc<Proc1>,
	pub(crate) mst: Arc<Mst>,
	pub(crate) fim: Arc<Fim>,
	pub(crate) acl: Arc<Acl>,
	pub(crate) names: Arc<Names>,
	pub(crate) xpd: Arc<Xpd>,
	audit: OnceLock<Arc<Audit>>,
}

impl Proc2 {
	/// Initializes the process manager: free list over slots 2..=69, slot 1
	/// installed as the init/system process.
	pub fn new(
		proc1: Arc<Proc1>,
		mst: Arc<Mst>,
		fim: Arc<Fim>,
		acl: Arc<Acl>,
		names: Arc<Names>,
		xpd: Arc<Xpd>,
	) -> Self {
		let system_uid = Uid::generate();
		let init_uid = Uid::generate();
		mst.fill_uid_table(system_uid);
		mst.set_asid_uid(1, init_uid);

		let mut slots: Vec<ProcEntry> = (0..N_SLOTS).map(|_| ProcEntry::default()).collect();
		for i in FIRST_FREE..N_SLOTS as u16 {
			slots[i as usize].next_free = if (i as usize) < N_SLOTS - 1 {
				ProcIx(i + 1)
			} else {
				ProcIx::NONE
			};
			slots[i as usize].uid = Uid::NIL;
		}
		// Slot 1: the init process
		let init = &mut slots[ProcIx::INIT.idx()];
		init.uid = init_uid;
		init.upid = 1;
		init.asid = 1;
		init.pid = proc1::BOOT_PID;
		init.lifecycle = Lifecycle::Valid;
		init.flags = ProcFlags::BOUND;
		init.session_id = 0;

		let mut pid_map = [0u16; MAX_TASKS];
		pid_map[proc1::BOOT_PID as usize] = ProcIx::INIT.0;

		let mut min = 0x10;
		let mut max = 0x10;
		proc1.set_priority(proc1::BOOT_PID, 0xFF00, &mut min, &mut max);

		let fork_ecs: Vec<Eventcount> = (0..N_SLOTS).map(|_| Eventcount::new()).collect();
		let cr_ecs: Vec<Eventcount> = (0..N_SLOTS).map(|_| Eventcount::new()).collect();

		Self {
			inner: Mutex::new(Tables {
				slots,
				alloc_head: ProcIx::INIT,
				free_head: ProcIx(FIRST_FREE),
				pid_map,
				pgroups: (0..N_SLOTS).map(|_| PgroupEntry::default()).collect(),
				next_upid: FIRST_UPID,
			}),
			fork_ecs,
			cr_ecs,
			system_uid,
			proc1,
			mst,
			fim,
			acl,
			names,
			xpd,
			audit: OnceLock::new(),
		}
	}

	/// Wires the audit subsystem in after construction.
	pub fn set_audit(&self, audit: Arc<Audit>) {
		let _ = self.audit.set(audit);
	}

	pub(crate) fn audit(&self) -> Option<&Arc<Audit>> {
		self.audit.get()
	}

	pub(crate) fn lock(&self) -> MutexGuard<'_, Tables> {
		self.inner.lock().unwrap()
	}

	pub(crate) fn fork_ec(&self, ix: ProcIx) -> &Eventcount {
		&self.fork_ecs[ix.idx()]
	}

	pub(crate) fn cr_ec(&self, ix: ProcIx) -> &Eventcount {
		&self.cr_ecs[ix.idx()]
	}

	/// Wakes whoever is waiting on the process's state changes: its
	/// debugger when present, its parent otherwise.
	pub(crate) fn awaken_guardian(&self, t: &Tables, ix: ProcIx) {
		let entry = t.entry(ix);
		let guardian = if !entry.debugger.is_none() {
			entry.debugger
		} else {
			entry.parent
		};
		if !guardian.is_none() {
			self.cr_ec(guardian).advance();
		}
	}

	/// Detaches a process from its parent given its predecessor in the
	/// sibling chain.
	///
	/// A detached zombie is freed on the spot; a live process becomes an
	/// orphan. A missing parent is an internal invariant violation.
	pub(crate) fn detach_from_parent(&self, t: &mut Tables, child: ProcIx, prev_sibling: ProcIx) {
		let parent = t.entry(child).parent;
		if parent.is_none() {
			crate::status::crash_system(Status::InternalError);
		}
		let next = t.entry(child).next_sibling;
		if prev_sibling.is_none() {
			t.entry_mut(parent).first_child = next;
		} else {
			t.entry_mut(prev_sibling).next_sibling = next;
		}
		t.entry_mut(child).parent = ProcIx::NONE;
		if t.entry(child).lifecycle == Lifecycle::Zombie {
			self.pgroup_cleanup(t, child, pgroup::CleanupMode::Refcount);
			t.unlink_alloc(child);
			t.free_slot(child);
		} else {
			t.entry_mut(child).flags |= ProcFlags::ORPHAN;
		}
	}

	/// Detaches a process from its parent, making it an orphan.
	pub fn make_orphan(&self, uid: Uid) -> KResult<()> {
		let mut t = self.lock();
		let target = match t.find_by_uid(uid) {
			Ok(ix) => ix,
			// Zombies may be orphaned too
			Err((Status::Zombie, ix)) => ix,
			Err((status, _)) => return Err(status),
		};
		let parent = t.entry(target).parent;
		if parent.is_none() {
			return Err(Status::AlreadyOrphan);
		}
		let prev = t.find_prev_sibling(parent, target)?;
		self.detach_from_parent(&mut t, target, prev);
		Ok(())
	}

	/// Returns the UPIDs of the calling process: own, pgroup, parent.
	pub fn get_my_upids(&self) -> (Upid, Upgid, Upid) {
		let t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			return (0, 1, 0);
		}
		let entry = t.entry(ix);
		let upgid = if entry.pgroup_ix == 0 {
			1
		} else {
			t.pgroups[entry.pgroup_ix as usize].upgid
		};
		(entry.upid, upgid, entry.parent_upid)
	}

	/// Returns the calling process's UPID.
	pub fn my_pid(&self) -> Upid {
		let t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			0
		} else {
			t.entry(ix).upid
		}
	}

	/// Returns the calling process's UID.
	pub fn who_am_i(&self) -> Uid {
		let t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			Uid::NIL
		} else {
			t.entry(ix).uid
		}
	}

	/// Returns the UID of the live process with the given UPID.
	pub fn upid_to_uid(&self, upid: Upid) -> KResult<Uid> {
		let t = self.lock();
		match t.find_by_upid(upid) {
			Ok(ix) => Ok(t.entry(ix).uid),
			Err((status, _)) => Err(status),
		}
	}

	/// Returns the UID of the leader of the pgroup with the given UPGID,
	/// falling back to any live member.
	pub fn upgid_to_uid(&self, upgid: Upgid) -> KResult<Uid> {
		let t = self.lock();
		let pg = pgroup::find_by_upgid(&t, upgid);
		if pg == 0 {
			return Err(Status::UidNotFound);
		}
		let mut any = None;
		for ix in t.iter_alloc() {
			let entry = t.entry(ix);
			if entry.pgroup_ix != pg || entry.lifecycle == Lifecycle::Zombie {
				continue;
			}
			if entry.upid == upgid {
				return Ok(entry.uid);
			}
			any.get_or_insert(entry.uid);
		}
		any.ok_or(Status::UidNotFound)
	}

	/// Snapshots the UIDs of every valid process, system process first.
	pub fn list(&self, max: usize) -> Vec<Uid> {
		let t = self.lock();
		let mut out = vec![self.system_uid];
		for ix in t.iter_alloc() {
			let entry = t.entry(ix);
			if entry.lifecycle == Lifecycle::Valid && entry.asid != 1 && out.len() < max {
				out.push(entry.uid);
			}
		}
		out.truncate(max.max(1));
		out
	}

	/// Snapshots one process.
	pub fn get_info(&self, uid: Uid) -> KResult<ProcInfo> {
		let t = self.lock();
		let ix = match t.find_by_uid(uid) {
			Ok(ix) => ix,
			Err((Status::Zombie, ix)) => ix,
			Err((status, _)) => return Err(status),
		};
		let entry = t.entry(ix);
		let upgid = if entry.pgroup_ix == 0 {
			1
		} else {
			t.pgroups[entry.pgroup_ix as usize].upgid
		};
		Ok(ProcInfo {
			uid: entry.uid,
			upid: entry.upid,
			parent_upid: entry.parent_upid,
			upgid,
			session_id: entry.session_id,
			asid: entry.asid,
			pid: entry.pid,
			lifecycle: entry.lifecycle,
			flags: entry.flags,
			pending: entry.sig.pending.0,
			blocked: entry.sig.blocked.0,
		})
	}

	/// Flags or unflags the calling process as a server process.
	pub fn set_server(&self, server: bool) -> KResult<()> {
		let mut t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			return Err(Status::UidNotFound);
		}
		t.entry_mut(ix).flags.set(ProcFlags::SERVER, server);
		Ok(())
	}

	/// Sets the scheduling priority of a process.
	pub fn set_priority(&self, uid: Uid, mut min: u16, mut max: u16) -> KResult<()> {
		let pid = {
			let t = self.lock();
			let ix = t.find_by_uid(uid).map_err(|(status, _)| status)?;
			t.entry(ix).pid
		};
		self.proc1.set_priority(pid, 0xFF00, &mut min, &mut max);
		Ok(())
	}

	/// Changes the calling process's session.
	///
	/// Re-claiming the own session as its pgroup leader requires `force`;
	/// a session ID colliding with a foreign pgroup is rejected, as is
	/// leaving for a new session while still holding a pgroup.
	pub fn set_session_id(&self, force: bool, session_id: u16) -> KResult<()> {
		let mut t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			return Err(Status::UidNotFound);
		}
		let (upid, own_session, own_pgroup) = {
			let entry = t.entry(ix);
			(entry.upid, entry.session_id, entry.pgroup_ix)
		};
		if session_id == upid {
			if session_id != 0 {
				let pg = pgroup::find_by_upgid(&t, session_id);
				if own_pgroup != 0 && own_pgroup == pg {
					if !force {
						return Err(Status::ProcessIsGroupLeader);
					}
				} else if pg != 0 {
					return Err(Status::ProcessUsingPgroupId);
				}
			}
		} else if session_id != 0 && own_session != 0 && own_pgroup != 0 {
			return Err(Status::PgroupInDifferentSession);
		}
		self.pgroup_cleanup(&mut t, ix, pgroup::CleanupMode::Both);
		t.entry_mut(ix).session_id = session_id;
		let leader = session_id != 0 && session_id == t.entry(ix).upid;
		t.entry_mut(ix).flags.set(ProcFlags::SESSION_LEADER, leader);
		self.pgroup_set(&mut t, ix, session_id)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	pub(crate) fn proc2() -> Proc2 {
		let dir = std::env::temp_dir();
		Proc2::new(
			Arc::new(Proc1::new()),
			Arc::new(Mst::new()),
			Arc::new(Fim::new()),
			Arc::new(Acl::new()),
			Arc::new(Names::new(dir)),
			Arc::new(Xpd::new()),
		)
	}

	fn count_free(t: &Tables) -> usize {
		let mut n = 0;
		let mut cur = t.free_head;
		while !cur.is_none() {
			n += 1;
			cur = t.entry(cur).next_free;
		}
		n
	}

	#[test]
	fn table_bijection() {
		let p2 = proc2();
		let mut t = p2.lock();
		let total = |t: &Tables| t.iter_alloc().count() + count_free(t);
		assert_eq!(total(&t), N_SLOTS - 1);
		// Allocate a few slots; the sum is preserved
		let a = t.alloc_slot().unwrap();
		let b = t.alloc_slot().unwrap();
		assert_eq!(total(&t), N_SLOTS - 1);
		t.unlink_alloc(a);
		t.free_slot(a);
		assert_eq!(total(&t), N_SLOTS - 1);
		// A freed slot is really gone from the allocated list
		assert!(t.iter_alloc().all(|ix| ix != a));
		assert!(t.iter_alloc().any(|ix| ix == b));
	}

	#[test]
	fn table_exhaustion() {
		let p2 = proc2();
		let mut t = p2.lock();
		for _ in 0..N_SLOTS - 2 {
			t.alloc_slot().unwrap();
		}
		assert_eq!(t.alloc_slot(), Err(Status::TableFull));
	}

	#[test]
	fn init_entry_assigns_fresh_ids() {
		let p2 = proc2();
		let mut t = p2.lock();
		let a = t.alloc_slot().unwrap();
		let b = t.alloc_slot().unwrap();
		let (uid_a, upid_a) = t.init_entry(a);
		let (uid_b, upid_b) = t.init_entry(b);
		assert_ne!(uid_a, uid_b);
		assert_ne!(upid_a, upid_b);
		assert!((FIRST_UPID..=LAST_UPID).contains(&upid_a));
	}

	#[test]
	fn graph_consistency() {
		let p2 = proc2();
		let mut t = p2.lock();
		let a = t.alloc_slot().unwrap();
		let b = t.alloc_slot().unwrap();
		let c = t.alloc_slot().unwrap();
		for ix in [a, b, c] {
			t.init_entry(ix);
			t.attach_child(ProcIx::INIT, ix);
		}
		// Each child appears exactly once in init's sibling chain
		for ix in [a, b, c] {
			let mut seen = 0;
			let mut cur = t.entry(ProcIx::INIT).first_child;
			while !cur.is_none() {
				if cur == ix {
					seen += 1;
				}
				cur = t.entry(cur).next_sibling;
			}
			assert_eq!(seen, 1);
			assert_eq!(t.entry(ix).parent, ProcIx::INIT);
		}
		// Predecessor lookup agrees with the chain
		assert_eq!(t.find_prev_sibling(ProcIx::INIT, c).unwrap(), ProcIx::NONE);
		assert_eq!(t.find_prev_sibling(ProcIx::INIT, b).unwrap(), c);
	}

	#[test]
	fn detach_live_child_sets_orphan() {
		let p2 = proc2();
		let mut t = p2.lock();
		let a = t.alloc_slot().unwrap();
		t.init_entry(a);
		t.attach_child(ProcIx::INIT, a);
		let prev = t.find_prev_sibling(ProcIx::INIT, a).unwrap();
		p2.detach_from_parent(&mut t, a, prev);
		assert!(t.entry(a).parent.is_none());
		assert!(t.entry(a).flags.contains(ProcFlags::ORPHAN));
		assert_eq!(t.entry(ProcIx::INIT).first_child, ProcIx::NONE);
	}

	#[test]
	fn find_by_uid_reports_zombie() {
		let p2 = proc2();
		let mut t = p2.lock();
		let a = t.alloc_slot().unwrap();
		let (uid, _) = t.init_entry(a);
		assert_eq!(t.find_by_uid(uid), Ok(a));
		t.entry_mut(a).lifecycle = Lifecycle::Zombie;
		assert_eq!(t.find_by_uid(uid), Err((Status::Zombie, a)));
		assert_eq!(
			t.find_by_uid(Uid::generate()),
			Err((Status::UidNotFound, ProcIx::NONE))
		);
	}
}
