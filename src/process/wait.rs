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

//! Waiting for child state changes.
//!
//! `wait` collects stopped and exited children. Between scans the caller
//! sleeps on two eventcounts: its creation-record counter, advanced whenever
//! a child changes state, and its quit counter, whose firing aborts the wait
//! with [`Status::AsyncFaultWhileWaiting`].

use super::{Lifecycle, ProcFlags, ProcIx, Proc2, Tables, Upid};
use crate::{
	ec,
	status::{KResult, Status},
	uid::Uid,
};

bitflags::bitflags! {
	/// Options of [`Proc2::wait`].
	#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
	pub struct WaitOptions: u16 {
		/// Poll instead of sleeping.
		const WNOHANG = 0x0001;
		/// Also report stopped children.
		const WUNTRACED = 0x0002;
	}
}

/// What a child is selected by.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Selector {
	Any,
	Upid(Upid),
	Pgroup(u16),
}

/// Result block of a wait.
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitResult {
	/// Accounting block of the reaped child.
	pub acct: [u32; 14],
	/// UID of the reaped child; NIL when only the status was collected.
	pub uid: Uid,
	/// Exit status words. A stop reports `(signal << 8) | 0x7F`.
	pub exit_status: [u32; 2],
	/// Resource usage of the reaped child.
	pub rusage: [u32; 5],
	/// The child was traced.
	pub traced: bool,
	/// The child was stopped when reaped.
	pub stopped: bool,
}

impl Proc2 {
	/// Waits for a child to stop or exit.
	///
	/// `selector` picks the children: `-1` any, positive a specific UPID
	/// (valid range 65..=30000), `0` the caller's pgroup, negative the
	/// pgroup `|selector|`. Returns the child's UPID, `0` under
	/// [`WaitOptions::WNOHANG`] with nothing ready.
	pub fn wait(
		&self,
		options: WaitOptions,
		selector: i32,
		result: &mut WaitResult,
	) -> KResult<Upid> {
		*result = WaitResult::default();
		if selector > 0 && !(65..=30000).contains(&selector) {
			return Err(Status::WaitFoundNoChildren);
		}
		loop {
			let (cur, asid, cr_trigger, quit_trigger) = {
				let mut t = self.lock();
				let cur = t.current_index();
				if cur.is_none() {
					return Err(Status::WaitFoundNoChildren);
				}
				let sel = match selector {
					-1 => Selector::Any,
					0 => Selector::Pgroup(t.entry(cur).pgroup_ix),
					s if s > 0 => Selector::Upid(s as Upid),
					s => Selector::Pgroup(super::pgroup::find_by_upgid(
						&t,
						s.unsigned_abs() as Upid,
					)),
				};
				if t.entry(cur).first_child.is_none() && t.entry(cur).first_zombie.is_none() {
					return Err(Status::WaitFoundNoChildren);
				}
				let mut found_matching = false;
				// Live children at the caller's priority
				let my_priority = t.entry(cur).priority;
				let mut prev = ProcIx::NONE;
				let mut child = t.entry(cur).first_child;
				while !child.is_none() {
					let next = t.entry(child).next_sibling;
					if t.entry(child).priority == my_priority && matches(&t, child, sel) {
						found_matching = true;
						if let Some(upid) =
							self.try_live_child(&mut t, child, options, cur, prev, result)
						{
							return Ok(upid);
						}
					}
					prev = child;
					child = next;
				}
				// Zombies
				let mut prev = ProcIx::NONE;
				let mut zombie = t.entry(cur).first_zombie;
				while !zombie.is_none() {
					let next = t.entry(zombie).next_zombie;
					if matches(&t, zombie, sel) {
						found_matching = true;
						if let Some(upid) =
							self.try_zombie(&mut t, zombie, cur, prev, result)
						{
							return Ok(upid);
						}
					}
					prev = zombie;
					zombie = next;
				}
				if !found_matching {
					return Err(Status::WaitFoundNoChildren);
				}
				if options.contains(WaitOptions::WNOHANG) {
					return Ok(0);
				}
				let asid = t.entry(cur).asid;
				(
					cur,
					asid,
					self.cr_ec(cur).read() + 1,
					self.fim.quit_ec(asid).read() + 1,
				)
			};
			let which = ec::waitn(&[
				(self.cr_ec(cur), cr_trigger),
				(self.fim.quit_ec(asid), quit_trigger),
			]);
			if which == 2 {
				return Err(Status::AsyncFaultWhileWaiting);
			}
		}
	}

	/// Collects a live child that stopped, or reaps one that turned
	/// zombie in place.
	fn try_live_child(
		&self,
		t: &mut Tables,
		child: ProcIx,
		options: WaitOptions,
		parent: ProcIx,
		prev: ProcIx,
		result: &mut WaitResult,
	) -> Option<Upid> {
		let flags = t.entry(child).flags;
		if flags.contains(ProcFlags::SUSPENDED)
			&& !flags.contains(ProcFlags::REPORTED)
			&& options.contains(WaitOptions::WUNTRACED)
		{
			t.entry_mut(child).flags.insert(ProcFlags::REPORTED);
			let stop_sig = t.entry(child).sig.stop_sig as u32;
			result.exit_status[0] = (stop_sig << 8) | 0x7F;
			result.stopped = true;
			return Some(t.entry(child).upid);
		}
		// A child held by a foreign debugger is not ours to collect
		let debugger = t.entry(child).debugger;
		if !debugger.is_none() && debugger != parent {
			return None;
		}
		if t.entry(child).lifecycle != Lifecycle::Zombie {
			return None;
		}
		Some(self.reap_child(t, child, parent, prev, false, result))
	}

	/// Collects a zombie from the caller's zombie list.
	fn try_zombie(
		&self,
		t: &mut Tables,
		zombie: ProcIx,
		parent: ProcIx,
		prev: ProcIx,
		result: &mut WaitResult,
	) -> Option<Upid> {
		let flags = t.entry(zombie).flags;
		if t.entry(zombie).lifecycle != Lifecycle::Zombie {
			// A stopped entry that strayed here only reports its stop
			if !flags.contains(ProcFlags::SUSPENDED) || flags.contains(ProcFlags::REPORTED) {
				return None;
			}
			t.entry_mut(zombie).flags.insert(ProcFlags::REPORTED);
			let stop_sig = t.entry(zombie).sig.stop_sig as u32;
			result.exit_status[0] = (stop_sig << 8) | 0x7F;
			result.stopped = true;
			return Some(t.entry(zombie).upid);
		}
		if flags.contains(ProcFlags::ORPHAN) {
			// Traced zombies take the full reap
			return Some(self.reap_child(t, zombie, parent, prev, true, result));
		}
		self.debug_clear_locked(t, zombie, false);
		let upid = self.reap_child(t, zombie, parent, prev, true, result);
		result.uid = Uid::NIL;
		Some(upid)
	}

	/// Reaps a child: detaches it from every list, frees its slot, and
	/// copies its exit block into the result.
	fn reap_child(
		&self,
		t: &mut Tables,
		child: ProcIx,
		parent: ProcIx,
		prev: ProcIx,
		on_zombie_list: bool,
		result: &mut WaitResult,
	) -> Upid {
		if !t.entry(child).debugger.is_none() {
			self.debug_clear_locked(t, child, false);
		}
		t.unlink_alloc(child);
		let next = if on_zombie_list {
			t.entry(child).next_zombie
		} else {
			t.entry(child).next_sibling
		};
		if on_zombie_list {
			if prev.is_none() {
				t.entry_mut(parent).first_zombie = next;
			} else {
				t.entry_mut(prev).next_zombie = next;
			}
		} else if prev.is_none() {
			t.entry_mut(parent).first_child = next;
		} else {
			t.entry_mut(prev).next_sibling = next;
		}
		self.pgroup_cleanup(t, child, super::pgroup::CleanupMode::Refcount);
		t.entry_mut(child).flags.remove(ProcFlags::REPORTED);
		let entry = t.entry(child).clone();
		t.free_slot(child);
		result.exit_status = entry.exit_status;
		result.rusage = entry.rusage;
		result.uid = entry.uid;
		result.acct = entry.acct;
		result.traced = entry.flags.contains(ProcFlags::ORPHAN);
		result.stopped = entry.flags.contains(ProcFlags::SUSPENDED);
		entry.upid
	}
}

/// Tells whether the child matches the wait selector.
fn matches(t: &Tables, child: ProcIx, sel: Selector) -> bool {
	match sel {
		Selector::Any => true,
		Selector::Upid(upid) => t.entry(child).upid == upid,
		Selector::Pgroup(pg) => pg != 0 && t.entry(child).pgroup_ix == pg,
	}
}
