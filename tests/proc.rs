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

//! Process lifecycle scenarios: fork, vfork completion, wait, orphaning,
//! process group signaling.

use kernel::{
	ec::Eventcount,
	proc1,
	process::{
		fork::TaskMain,
		signal,
		wait::{WaitOptions, WaitResult},
		Lifecycle, ProcFlags, ProcInfo,
	},
	status::Status,
	uid::Uid,
	Kernel,
};
use std::{
	sync::{mpsc, Arc},
	time::Duration,
};

fn kernel() -> (tempfile::TempDir, Kernel) {
	let dir = tempfile::tempdir().unwrap();
	let kernel = Kernel::new(dir.path().to_path_buf());
	(dir, kernel)
}

/// An entry that parks until the eventcount reaches 1.
fn parked(park: &Arc<Eventcount>) -> TaskMain {
	let park = park.clone();
	Arc::new(move |_| {
		park.wait(1);
	})
}

fn wait_for<F: FnMut() -> bool>(mut cond: F, what: &str) {
	for _ in 0..500 {
		if cond() {
			return;
		}
		std::thread::sleep(Duration::from_millis(10));
	}
	panic!("timed out waiting for {what}");
}

fn info(kernel: &Kernel, uid: Uid) -> ProcInfo {
	kernel.proc2.get_info(uid).unwrap()
}

#[test]
fn fork_then_wait() {
	let (_dir, kernel) = kernel();
	let p2 = kernel.proc2.clone();
	let child: TaskMain = {
		let p2 = p2.clone();
		Arc::new(move |_| {
			let me = p2.who_am_i();
			let image: TaskMain = {
				let p2 = p2.clone();
				Arc::new(move |_| {
					p2.exit(7);
				})
			};
			let _ = p2.complete_vfork(me, 0x100, 0, image, 0);
		})
	};
	let ret = p2.fork(child, 0, 0).unwrap();
	assert!(ret.completed);
	let mut result = WaitResult::default();
	let upid = p2.wait(WaitOptions::empty(), -1, &mut result).unwrap();
	assert_eq!(upid, ret.upid);
	assert_eq!(result.exit_status[0], 0x0000_0700);
	assert!(result.uid.is_nil());
	// The slot went back to the free list
	assert!(p2.get_info(ret.uid).is_err());
	assert_eq!(p2.upid_to_uid(ret.upid), Err(Status::UidNotFound));
}

#[test]
fn wait_selector_bounds() {
	let (_dir, kernel) = kernel();
	let mut result = WaitResult::default();
	assert_eq!(
		kernel.proc2.wait(WaitOptions::empty(), 31000, &mut result),
		Err(Status::WaitFoundNoChildren)
	);
	assert_eq!(
		kernel.proc2.wait(WaitOptions::empty(), 64, &mut result),
		Err(Status::WaitFoundNoChildren)
	);
	// No children at all
	assert_eq!(
		kernel.proc2.wait(WaitOptions::empty(), -1, &mut result),
		Err(Status::WaitFoundNoChildren)
	);
}

#[test]
fn wait_wnohang_polls() {
	let (_dir, kernel) = kernel();
	let p2 = kernel.proc2.clone();
	let park = Arc::new(Eventcount::new());
	let ret = p2.fork(parked(&park), 0, 1).unwrap();
	let mut result = WaitResult::default();
	// The child is alive: nothing to collect yet
	assert_eq!(p2.wait(WaitOptions::WNOHANG, -1, &mut result), Ok(0));
	park.advance();
	wait_for(
		|| matches!(p2.get_info(ret.uid), Ok(i) if i.lifecycle == Lifecycle::Zombie),
		"child exit",
	);
	let upid = p2.wait(WaitOptions::WNOHANG, -1, &mut result).unwrap();
	assert_eq!(upid, ret.upid);
}

#[test]
fn signal_pgroup_sets_pending_and_audits() {
	let (_dir, kernel) = {
		let dir = tempfile::tempdir().unwrap();
		// A non-selective audit list so every event is recorded
		let audit_dir = dir.path().join("node_data/audit");
		std::fs::create_dir_all(&audit_dir).unwrap();
		let list = kernel::audit::list::AuditList {
			list_uid: Uid::generate(),
			timeout_units: 0,
			flags: kernel::audit::list::ListFlags::empty(),
			entries: vec![],
		};
		std::fs::write(audit_dir.join("audit_list"), list.to_bytes()).unwrap();
		let kernel = Kernel::new(dir.path().to_path_buf());
		(dir, kernel)
	};
	kernel.audit.start_logging().unwrap();
	let p2 = kernel.proc2.clone();
	let park = Arc::new(Eventcount::new());
	let a = p2.fork(parked(&park), 0, 1).unwrap();
	let b = p2.fork(parked(&park), 0, 1).unwrap();
	// A leads a fresh group; B joins it
	p2.set_pgroup(a.uid, a.upid).unwrap();
	p2.set_pgroup(b.uid, a.upid).unwrap();
	p2.signal_pgroup(a.upid, 15, 0, true).unwrap();
	let term_bit = 1 << 14;
	assert_ne!(info(&kernel, a.uid).pending & term_bit, 0);
	assert_ne!(info(&kernel, b.uid).pending & term_bit, 0);
	// Exactly one pgroup event went to the audit log
	let records =
		kernel::audit::log::EventRecord::decode_all(&kernel.audit.read_log().unwrap());
	let events: Vec<_> = records
		.iter()
		.filter(|r| r.event_uid.high == 0x4165_836C)
		.collect();
	assert_eq!(events.len(), 1);
	assert_eq!(events[0].upgid, a.upid);
	assert_eq!(events[0].status, 0);
	assert_eq!(events[0].event_flags, 1);
	// Signaling an empty group reports the absence
	assert_eq!(
		p2.signal_pgroup(29999, 15, 0, true),
		Err(Status::UidNotFound)
	);
	park.advance();
	let mut result = WaitResult::default();
	p2.wait(WaitOptions::empty(), -1, &mut result).unwrap();
	p2.wait(WaitOptions::empty(), -1, &mut result).unwrap();
	kernel.audit.stop_logging().unwrap();
}

#[test]
fn sigpause_wakes_on_signal() {
	let (_dir, kernel) = kernel();
	let p2 = kernel.proc2.clone();
	let (tx, rx) = mpsc::channel();
	let entry: TaskMain = {
		let p2 = p2.clone();
		Arc::new(move |_| {
			let (mask, _) = p2.sigpause(0);
			let me = p2.get_info(p2.who_am_i()).unwrap();
			tx.send((mask, me.pending & !me.blocked)).unwrap();
		})
	};
	let ret = p2.fork(entry, 0, 1).unwrap();
	assert!(ret.completed);
	std::thread::sleep(Duration::from_millis(50));
	p2.signal_process(ret.uid, 10, 0, false).unwrap();
	let (mask, deliverable) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
	assert_eq!(mask, 0);
	// SIGUSR1 arrived and nothing masks it
	assert_ne!(deliverable & (1 << 9), 0);
	let mut result = WaitResult::default();
	let upid = p2.wait(WaitOptions::empty(), -1, &mut result).unwrap();
	assert_eq!(upid, ret.upid);
}

#[test]
fn orphaned_zombie_frees_directly() {
	let (_dir, kernel) = kernel();
	let p2 = kernel.proc2.clone();
	let park_child = Arc::new(Eventcount::new());
	let (tx, rx) = mpsc::channel();
	let parent_entry: TaskMain = {
		let p2 = p2.clone();
		let park_child = park_child.clone();
		Arc::new(move |_| {
			let child = p2.fork(parked(&park_child), 0, 1).unwrap();
			tx.send(child).unwrap();
			// Return: the parent exits while the child lives on
		})
	};
	let parent = p2.fork(parent_entry, 0, 1).unwrap();
	let child = rx.recv_timeout(Duration::from_secs(10)).unwrap();
	let mut result = WaitResult::default();
	let upid = p2.wait(WaitOptions::empty(), -1, &mut result).unwrap();
	assert_eq!(upid, parent.upid);
	// The child is an orphan now
	let child_info = info(&kernel, child.uid);
	assert!(child_info.flags.contains(ProcFlags::ORPHAN));
	// Its exit frees the slot without passing through any zombie list
	park_child.advance();
	wait_for(
		|| p2.get_info(child.uid).is_err(),
		"orphan slot release",
	);
	assert_eq!(p2.get_info(child.uid), Err(Status::UidNotFound));
}

#[test]
fn orphaned_pgroup_gets_hup_and_cont() {
	let (_dir, kernel) = kernel();
	let p2 = kernel.proc2.clone();
	let park = Arc::new(Eventcount::new());
	let park_x = Arc::new(Eventcount::new());

	// L: session leader in its own group G
	let l = p2.fork(parked(&park), 0, 1).unwrap();
	let l_info = info(&kernel, l.uid);
	let x = {
		let _as_l = proc1::enter(l_info.pid, l_info.asid);
		p2.set_session_id(false, l.upid).unwrap();
		// X: child of L, inherits session and G
		p2.fork(parked(&park_x), 0, 1).unwrap()
	};
	let x_info = info(&kernel, x.uid);
	// X leaves for its own group H, then parents Y back into G
	let y = {
		let _as_x = proc1::enter(x_info.pid, x_info.asid);
		p2.set_pgroup(x.uid, x.upid).unwrap();
		let y = p2.fork(parked(&park), 0, 1).unwrap();
		p2.set_pgroup(y.uid, l.upid).unwrap();
		y
	};
	// X is the only same-session process outside G related to a member
	assert_eq!(p2.pgroup_info(l.upid).unwrap().leader_count, 1);

	// X exits; G loses its last outside relative and is orphaned
	park_x.advance();
	wait_for(
		|| matches!(p2.get_info(x.uid), Ok(i) if i.lifecycle == Lifecycle::Zombie),
		"X exit",
	);
	assert_eq!(p2.pgroup_info(l.upid).unwrap().leader_count, 0);
	let hup = 1 << 0;
	let cont = 1 << (signal::SIGCONT_WAIT - 1);
	for uid in [l.uid, y.uid] {
		let member = info(&kernel, uid);
		assert_ne!(member.pending & hup, 0, "SIGHUP missing");
		assert_ne!(member.pending & cont, 0, "SIGCONT missing");
	}
	park.advance();
}

#[test]
fn fork_copies_signal_state() {
	let (_dir, kernel) = kernel();
	let p2 = kernel.proc2.clone();
	let park = Arc::new(Eventcount::new());
	// Block SIGUSR2 and leave one raised on the parent
	p2.sigsetmask(1 << 11);
	p2.signal_process(p2.who_am_i(), 12, 0, false).unwrap();
	let parent = p2.get_info(p2.who_am_i()).unwrap();
	assert_ne!(parent.pending & (1 << 11), 0);
	let ret = p2.fork(parked(&park), 0, 1).unwrap();
	// The child starts with the parent's masks and pending set
	let child = info(&kernel, ret.uid);
	assert_eq!(child.blocked, parent.blocked);
	assert_eq!(child.pending, parent.pending);
	// The returned identifiers resolve back to the child
	assert_eq!(p2.upid_to_uid(ret.upid), Ok(ret.uid));
	assert_eq!(child.upid, ret.upid);
	p2.sigsetmask(0);
	park.advance();
	let mut result = WaitResult::default();
	p2.wait(WaitOptions::empty(), -1, &mut result).unwrap();
}

#[test]
fn sigsetmask_swap_reports_old_mask() {
	let (_dir, kernel) = kernel();
	let p2 = kernel.proc2.clone();
	let (old, _) = p2.sigsetmask(0x00F0);
	assert_eq!(old, 0);
	let (old, _) = p2.sigsetmask(0x00F0);
	assert_eq!(old, 0x00F0);
	p2.sigsetmask(0);
}

#[test]
fn make_orphan_detaches_once() {
	let (_dir, kernel) = kernel();
	let p2 = kernel.proc2.clone();
	let park = Arc::new(Eventcount::new());
	let child = p2.fork(parked(&park), 0, 1).unwrap();
	p2.make_orphan(child.uid).unwrap();
	assert!(info(&kernel, child.uid).flags.contains(ProcFlags::ORPHAN));
	assert_eq!(p2.make_orphan(child.uid), Err(Status::AlreadyOrphan));
	// An orphan is invisible to wait
	let mut result = WaitResult::default();
	assert_eq!(
		p2.wait(WaitOptions::empty(), -1, &mut result),
		Err(Status::WaitFoundNoChildren)
	);
	park.advance();
	wait_for(|| p2.get_info(child.uid).is_err(), "orphan exit");
}
