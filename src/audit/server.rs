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

//! The audit flush server.
//!
//! A dedicated kernel task drains the audit buffer: it sleeps on the audit
//! eventcount and, when periodic flushing is configured, additionally on a
//! clock deadline. A timeout wake writes the dirty buffer back to the log.

use super::{list::ListFlags, Audit};
use crate::{ec, proc1, time};
use std::sync::atomic::Ordering;

/// Default flush deadline in clock ticks, roughly eight minutes.
pub const DEFAULT_FLUSH_TICKS: u32 = 0x1E0;

/// What woke the server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Woken {
	/// The audit eventcount advanced.
	Counter,
	/// The flush deadline passed.
	Timer,
}

impl Audit {
	/// Body of the flush server task. Runs until logging is disabled, then
	/// unbinds itself.
	pub(crate) fn server(&self) {
		let pid = proc1::current();
		{
			// The server's own file traffic must not be audited
			let mut suspend = self.suspend.lock().unwrap();
			suspend[pid as usize] = 1;
		}
		self.server_running.store(true, Ordering::SeqCst);
		self.acl.enter_super();
		while self.is_enabled() {
			let deadline = {
				let data = self.exclusion();
				data.flags.contains(ListFlags::TIMEOUT).then(|| {
					let ticks = if data.timeout == 0 {
						DEFAULT_FLUSH_TICKS
					} else {
						data.timeout as u32
					};
					time::TICK * ticks
				})
			};
			let trigger = self.ec.read() + 1;
			let woken = match deadline {
				Some(timeout) => {
					match ec::waitn_deadline(&[(&self.ec, trigger)], timeout) {
						Some(_) => Woken::Counter,
						None => Woken::Timer,
					}
				}
				None => {
					self.ec.wait(trigger);
					Woken::Counter
				}
			};
			if woken == Woken::Timer {
				let mut data = self.exclusion();
				if let Some(log) = data.log.as_mut() {
					if log.dirty {
						log.dirty = false;
						let _ = log.flush();
					}
				}
			}
		}
		self.server_running.store(false, Ordering::SeqCst);
		self.acl.exit_super();
		// Unbind through the recorded slot; fall back to the running task
		// when the spawner has not stored it yet
		let recorded = *self.server_pid.lock().unwrap();
		let _ = self.proc1.unbind(if recorded != 0 {
			recorded
		} else {
			pid
		});
	}
}

#[cfg(test)]
mod test {
	use super::super::list::{AuditList, ListFlags};
	use super::super::test::audit_at;
	use crate::uid::Uid;
	use std::time::Duration;

	#[test]
	fn server_exits_when_disabled() {
		let dir = tempfile::tempdir().unwrap();
		let audit = audit_at(dir.path());
		let list_dir = dir.path().join("node_data/audit");
		std::fs::create_dir_all(&list_dir).unwrap();
		std::fs::write(
			list_dir.join("audit_list"),
			AuditList {
				list_uid: Uid::generate(),
				timeout_units: 0,
				flags: ListFlags::empty(),
				entries: vec![],
			}
			.to_bytes(),
		)
		.unwrap();
		audit.start_logging().unwrap();
		assert!(audit.server_running.load(std::sync::atomic::Ordering::SeqCst));
		audit.stop_logging().unwrap();
		// The stop advances the eventcount; the server notices and leaves
		for _ in 0..100 {
			if !audit.server_running.load(std::sync::atomic::Ordering::SeqCst) {
				return;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		panic!("audit server did not exit");
	}
}
