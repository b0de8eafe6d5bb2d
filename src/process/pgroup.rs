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

//! Process groups.
//!
//! A process group is a set of processes in one session sharing a UPGID.
//! `ref_count` counts the members; a slot with a zero refcount is free.
//! `leader_count` counts the processes outside the group, in the same
//! session, that are a parent or child of a member. When it drops to zero
//! while a session leader is still a member, the group is orphaned and every
//! member receives SIGHUP then SIGCONT.

use super::{pgroup, signal, ProcFlags, ProcIx, Proc2, Tables, Upgid};
use crate::status::{crash_system, KResult, Status};

/// A process group table entry. Free when `ref_count` is zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct PgroupEntry {
	pub upgid: Upgid,
	pub session_id: u16,
	pub ref_count: i16,
	pub leader_count: i16,
}

/// Selects which side of a pgroup detach to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CleanupMode {
	/// Only adjust leader counts.
	LeaderCounts,
	/// Only drop the membership refcount.
	Refcount,
	/// Both.
	Both,
}

/// Finds a live pgroup by UPGID. Returns 0 when none matches.
pub fn find_by_upgid(t: &Tables, upgid: Upgid) -> u16 {
	for i in 1..t.pgroups.len() {
		let pg = &t.pgroups[i];
		if pg.ref_count > 0 && pg.upgid == upgid {
			return i as u16;
		}
	}
	0
}

impl Proc2 {
	/// Moves a process into the pgroup named by `new_upgid`, allocating a
	/// table slot when the group does not exist yet. `new_upgid == 0`
	/// leaves the current group.
	///
	/// A full pgroup table is an unrecoverable invariant violation.
	pub(crate) fn pgroup_set(
		&self,
		t: &mut Tables,
		ix: ProcIx,
		new_upgid: Upgid,
	) -> KResult<()> {
		if new_upgid == 0 {
			self.pgroup_cleanup(t, ix, CleanupMode::Both);
			t.entry_mut(ix).pgroup_ix = 0;
			return Ok(());
		}
		let session_id = t.entry(ix).session_id;
		let mut pg = find_by_upgid(t, new_upgid);
		if pg == 0 {
			let free = (1..t.pgroups.len()).find(|&i| t.pgroups[i].ref_count == 0);
			let Some(free) = free else {
				crash_system(Status::TableFull);
			};
			pg = free as u16;
			t.pgroups[free] = PgroupEntry {
				upgid: new_upgid,
				session_id,
				ref_count: 1,
				leader_count: 0,
			};
		} else {
			if t.pgroups[pg as usize].session_id != session_id {
				return Err(Status::PgroupInDifferentSession);
			}
			t.pgroups[pg as usize].ref_count += 1;
		}
		let old = t.entry(ix).pgroup_ix;
		if old != 0 {
			t.pgroups[old as usize].ref_count -= 1;
		}
		// Leader counts relative to the parent
		let parent = t.entry(ix).parent;
		if !parent.is_none() && t.entry(parent).session_id == session_id {
			let parent_pg = t.entry(parent).pgroup_ix;
			if old != 0 && old != parent_pg {
				t.pgroups[old as usize].leader_count -= 1;
			}
			if pg != parent_pg {
				t.pgroups[pg as usize].leader_count += 1;
			}
		}
		// Mirror the adjustment on every same-session child
		let mut child = t.entry(ix).first_child;
		while !child.is_none() {
			let next = t.entry(child).next_sibling;
			if t.entry(child).session_id == session_id {
				let child_pg = t.entry(child).pgroup_ix;
				// Leaving the child's group makes us a leader for it
				if child_pg != 0 && child_pg == old {
					t.pgroups[child_pg as usize].leader_count += 1;
				}
				// Joining the child's group stops us counting for it
				if child_pg != 0 && child_pg == pg {
					t.pgroups[child_pg as usize].leader_count -= 1;
				}
			}
			child = next;
		}
		t.entry_mut(ix).pgroup_ix = pg;
		Ok(())
	}

	/// Detaches a process from its pgroup accounting.
	pub(crate) fn pgroup_cleanup(&self, t: &mut Tables, ix: ProcIx, mode: CleanupMode) {
		let pg = t.entry(ix).pgroup_ix;
		if pg == 0 {
			return;
		}
		let session_id = t.entry(ix).session_id;
		if mode != CleanupMode::Refcount {
			let parent = t.entry(ix).parent;
			if !parent.is_none()
				&& t.entry(parent).pgroup_ix != pg
				&& t.entry(parent).session_id == session_id
			{
				self.pgroup_decr_leader_count(t, pg);
			}
			let mut child = t.entry(ix).first_child;
			while !child.is_none() {
				let next = t.entry(child).next_sibling;
				let child_pg = t.entry(child).pgroup_ix;
				if child_pg != pg && t.entry(child).session_id == session_id {
					self.pgroup_decr_leader_count(t, child_pg);
				}
				child = next;
			}
		}
		if mode != CleanupMode::LeaderCounts {
			t.pgroups[pg as usize].ref_count -= 1;
			t.entry_mut(ix).pgroup_ix = 0;
		}
	}

	/// Decrements a group's leader count. At zero, a group still holding a
	/// session leader has become orphaned: every member gets SIGHUP, then
	/// SIGCONT.
	pub(crate) fn pgroup_decr_leader_count(&self, t: &mut Tables, pg: u16) {
		if pg == 0 {
			return;
		}
		t.pgroups[pg as usize].leader_count -= 1;
		if t.pgroups[pg as usize].leader_count != 0 {
			return;
		}
		let has_leader = t.iter_alloc().any(|ix| {
			let entry = t.entry(ix);
			entry.flags.contains(ProcFlags::SESSION_LEADER) && entry.pgroup_ix == pg
		});
		if has_leader {
			let _ = self.signal_pgroup_locked(t, pg, signal::SIGHUP, 0, false);
			let _ = self.signal_pgroup_locked(t, pg, signal::SIGCONT_WAIT, 0, false);
		}
	}

	/// Changes the pgroup of the process named by `uid`.
	///
	/// The caller must share the target's session, or be its parent while
	/// the target is neither orphaned nor released by its debugger. A
	/// session leader cannot leave its group, and the destination group
	/// must live in the target's session.
	pub fn set_pgroup(&self, uid: crate::uid::Uid, new_upgid: Upgid) -> KResult<()> {
		let mut t = self.lock();
		let target = t.find_by_uid(uid).map_err(|(status, _)| status)?;
		let cur = t.current_index();
		if cur.is_none() {
			return Err(Status::UidNotFound);
		}
		if cur != target {
			let (cur_session, target_session) =
				(t.entry(cur).session_id, t.entry(target).session_id);
			if cur_session != target_session {
				if t.entry(target).parent != cur {
					return Err(Status::UidNotFound);
				}
				let flags = t.entry(target).flags;
				if flags.contains(ProcFlags::ORPHAN) && t.entry(target).debugger.is_none() {
					return Err(Status::PermissionDenied);
				}
				return Err(Status::PgroupInDifferentSession);
			}
		}
		if new_upgid != 0 {
			let entry = t.entry(target);
			// A session leader keeps its group
			if entry.session_id != 0 && entry.session_id == entry.upid {
				return Err(Status::PgroupInDifferentSession);
			}
			if new_upgid != entry.upid {
				let pg = pgroup::find_by_upgid(&t, new_upgid);
				if pg == 0
					|| t.pgroups[pg as usize].session_id != t.entry(cur).session_id
				{
					return Err(Status::PgroupInDifferentSession);
				}
			}
		}
		self.pgroup_set(&mut t, target, new_upgid)?;
		if new_upgid == 0 {
			t.entry_mut(target).session_id = 0;
		}
		Ok(())
	}

	/// Snapshots a pgroup table entry by UPGID.
	pub fn pgroup_info(&self, upgid: Upgid) -> Option<PgroupEntry> {
		let t = self.lock();
		let pg = find_by_upgid(&t, upgid);
		(pg != 0).then(|| t.pgroups[pg as usize])
	}
}

#[cfg(test)]
mod test {
	use super::super::test::proc2;
	use super::*;

	#[test]
	fn refcount_matches_membership() {
		let p2 = proc2();
		let mut t = p2.lock();
		let a = t.alloc_slot().unwrap();
		let b = t.alloc_slot().unwrap();
		t.init_entry(a);
		t.init_entry(b);
		t.entry_mut(a).session_id = 5;
		t.entry_mut(b).session_id = 5;
		p2.pgroup_set(&mut t, a, 100).unwrap();
		p2.pgroup_set(&mut t, b, 100).unwrap();
		let pg = find_by_upgid(&t, 100);
		assert_ne!(pg, 0);
		assert_eq!(t.pgroups[pg as usize].ref_count, 2);
		let members = t
			.iter_alloc()
			.filter(|&ix| t.entry(ix).pgroup_ix == pg)
			.count();
		assert_eq!(members as i16, t.pgroups[pg as usize].ref_count);
		// Leaving drops the refcount; the last leave frees the slot
		p2.pgroup_cleanup(&mut t, a, CleanupMode::Refcount);
		assert_eq!(t.pgroups[pg as usize].ref_count, 1);
		p2.pgroup_cleanup(&mut t, b, CleanupMode::Refcount);
		assert_eq!(t.pgroups[pg as usize].ref_count, 0);
		assert_eq!(find_by_upgid(&t, 100), 0);
	}

	#[test]
	fn rejoining_requires_same_session() {
		let p2 = proc2();
		let mut t = p2.lock();
		let a = t.alloc_slot().unwrap();
		let b = t.alloc_slot().unwrap();
		t.init_entry(a);
		t.init_entry(b);
		t.entry_mut(a).session_id = 5;
		t.entry_mut(b).session_id = 6;
		p2.pgroup_set(&mut t, a, 100).unwrap();
		assert_eq!(
			p2.pgroup_set(&mut t, b, 100),
			Err(Status::PgroupInDifferentSession)
		);
	}

	#[test]
	fn leader_count_tracks_parent() {
		let p2 = proc2();
		let mut t = p2.lock();
		let parent = t.alloc_slot().unwrap();
		let child = t.alloc_slot().unwrap();
		t.init_entry(parent);
		t.init_entry(child);
		t.entry_mut(parent).session_id = 5;
		t.entry_mut(child).session_id = 5;
		t.attach_child(parent, child);
		p2.pgroup_set(&mut t, parent, 100).unwrap();
		// The child joins a different group: its parent counts as a leader
		p2.pgroup_set(&mut t, child, 101).unwrap();
		let pg = find_by_upgid(&t, 101);
		assert_eq!(t.pgroups[pg as usize].leader_count, 1);
		// The child moving into the parent's group removes the leader
		p2.pgroup_set(&mut t, child, 100).unwrap();
		let pg = find_by_upgid(&t, 100);
		assert_eq!(t.pgroups[pg as usize].leader_count, 0);
	}
}
