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

//! Security event logging.
//!
//! Audit records security-relevant events into a persistent append-only
//! log drained by a dedicated server task. A per-PID suspension counter
//! silences auditing for a process; the logging path suspends itself so a
//! write can never audit recursively.
//!
//! When the selective list is loaded, only listed event UIDs are recorded.
//! A failed initialization puts the subsystem into `corrupted` mode where
//! every event is logged regardless of the list, and only an administrator
//! can stop auditing.

pub mod list;
pub mod log;
pub mod server;

use crate::{
	acl::{Acl, RIGHTS_ADMIN},
	ec::Eventcount,
	name::Names,
	proc1,
	proc1::{Pid, Proc1, MAX_TASKS},
	process::Proc2,
	status::{crash_system, KResult, Status},
	time,
	uid::Uid,
};
use self::list::{AuditList, HashTable, ListFlags};
use self::log::{EventRecord, LogFile, MAX_DATA_SIZE};
use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, Mutex, MutexGuard, OnceLock, Weak,
};

/// Path of the audit log file.
const LOG_PATH: &str = "//node_data/audit/audit_log";
/// Path of the selective list file.
const LIST_PATH: &str = "//node_data/audit/audit_list";
/// Path whose ACL gates the control operations.
const ADMIN_PATH: &str = "//node_data/audit";

/// Node identifier recorded in event headers.
const NODE_ID: u32 = 1;

/// Warning lines printed when event logging cannot start. The texts are
/// load-bearing: operators grep for them.
const MSG_WARNING: &str = "        Warning: could not start audit event logging...";
const MSG_ALL_EVENTS: &str = "All events will be logged.   ";
const MSG_ADMINS_ONLY: &str =
	"Only audit administrators will be able to stop auditing...";

/// Control operations of [`Audit::control`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Control {
	/// Reload the selective list.
	LoadList,
	/// Flush the log buffer to disk.
	Flush,
	/// Start event logging.
	Start,
	/// Stop event logging.
	Stop,
	/// Suspend auditing of the calling process.
	SuspendSelf,
	/// Resume auditing of the calling process.
	ResumeSelf,
	/// Query whether logging is enabled.
	IsEnabled,
}

/// State guarded by the audit exclusion lock.
#[derive(Default)]
pub(crate) struct AuditData {
	pub log: Option<LogFile>,
	pub list_uid: Uid,
	pub flags: ListFlags,
	/// Flush timeout in 4-second units, 0 for the default.
	pub timeout: u16,
	pub list_count: u16,
	pub hash: HashTable,
}

/// The audit subsystem.
pub struct Audit {
	enabled: AtomicBool,
	corrupted: AtomicBool,
	/// Per-PID suspension counters; auditing is off for a PID while > 0.
	suspend: Mutex<[i16; MAX_TASKS]>,
	/// The exclusion lock around the log and list state.
	inner: Mutex<AuditData>,
	/// Advanced on every state change the server must notice.
	pub(crate) ec: Eventcount,
	pub(crate) server_running: AtomicBool,
	server_pid: Mutex<Pid>,

	pub(crate) acl: Arc<Acl>,
	pub(crate) names: Arc<Names>,
	pub(crate) proc1: Arc<Proc1>,
	proc2: OnceLock<Weak<Proc2>>,
}

impl Audit {
	pub fn new(acl: Arc<Acl>, names: Arc<Names>, proc1: Arc<Proc1>) -> Self {
		Self {
			enabled: AtomicBool::new(false),
			corrupted: AtomicBool::new(false),
			suspend: Mutex::new([0; MAX_TASKS]),
			inner: Mutex::new(AuditData::default()),
			ec: Eventcount::new(),
			server_running: AtomicBool::new(false),
			server_pid: Mutex::new(0),
			acl,
			names,
			proc1,
			proc2: OnceLock::new(),
		}
	}

	/// Wires the process manager in after construction.
	pub fn set_proc2(&self, proc2: Weak<Proc2>) {
		let _ = self.proc2.set(proc2);
	}

	pub(crate) fn exclusion(&self) -> MutexGuard<'_, AuditData> {
		self.inner.lock().unwrap()
	}

	/// Tells whether event logging is enabled.
	pub fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::SeqCst)
	}

	/// Tells whether the subsystem runs in corrupted (log-everything) mode.
	pub fn is_corrupted(&self) -> bool {
		self.corrupted.load(Ordering::SeqCst)
	}

	/// Initializes the subsystem and attempts to start logging.
	///
	/// On failure the three warning lines are emitted, the subsystem
	/// enters corrupted mode, and logging is forced open without the
	/// selective list so every subsequent event is recorded.
	pub fn init(self: &Arc<Self>) {
		{
			let mut suspend = self.suspend.lock().unwrap();
			suspend.fill(0);
		}
		self.ec.init(0);
		self.acl.enter_super();
		let started = self.start_logging();
		if let Err(status) = started {
			::log::warn!("{MSG_WARNING} (status {:#010x})", status.code());
			::log::warn!("{MSG_ALL_EVENTS}");
			::log::warn!("{MSG_ADMINS_ONLY}");
			self.corrupted.store(true, Ordering::SeqCst);
			// Keep recording: open the log without the list
			let opened = {
				let mut data = self.exclusion();
				self.open_log(&mut data)
			};
			if opened.is_ok() {
				self.enabled.store(true, Ordering::SeqCst);
				self.start_server();
			}
		}
		self.acl.exit_super();
	}

	/// Stops the subsystem, ignoring errors.
	pub fn shutdown(&self) {
		let _ = self.stop_logging();
	}

	/// Starts event logging: loads the selective list, opens the log, and
	/// wakes or spawns the flush server.
	pub fn start_logging(self: &Arc<Self>) -> KResult<()> {
		if self.is_enabled() {
			return Err(Status::EventLoggingAlreadyStarted);
		}
		self.load_list()?;
		{
			let mut data = self.exclusion();
			self.open_log(&mut data)?;
		}
		self.enabled.store(true, Ordering::SeqCst);
		self.start_server();
		Ok(())
	}

	fn start_server(self: &Arc<Self>) {
		if self.server_running.swap(true, Ordering::SeqCst) {
			// Server already up; nudge it
			self.ec.advance();
			return;
		}
		let audit = self.clone();
		let spawned = self.proc1.create_p(
			Box::new(move || {
				audit.server();
			}),
			0x1400_000E,
		);
		match spawned {
			Ok(pid) => *self.server_pid.lock().unwrap() = pid,
			Err(_) => {
				self.server_running.store(false, Ordering::SeqCst);
				self.enabled.store(false, Ordering::SeqCst);
			}
		}
	}

	/// Stops event logging and closes the log.
	pub fn stop_logging(&self) -> KResult<()> {
		if !self.is_enabled() {
			return Err(Status::EventLoggingAlreadyStopped);
		}
		self.enabled.store(false, Ordering::SeqCst);
		self.ec.advance();
		let mut data = self.exclusion();
		self.close_log(&mut data)
	}

	/// Loads the selective list from `//node_data/audit/audit_list`.
	///
	/// A missing file turns selective auditing off and succeeds.
	pub fn load_list(&self) -> KResult<bool> {
		let list_uid = match self.names.resolve(LIST_PATH) {
			Ok(uid) => uid,
			Err(Status::NameNotFound) => {
				let mut data = self.exclusion();
				data.flags = ListFlags::empty();
				data.list_count = 0;
				data.hash.clear();
				return Ok(false);
			}
			Err(status) => return Err(status),
		};
		let path = self.names.path_of(list_uid)?;
		let bytes = std::fs::read(path)?;
		let parsed = AuditList::parse(&bytes)?;
		{
			let mut data = self.exclusion();
			data.hash.clear();
			data.flags = parsed.flags;
			data.list_uid = parsed.list_uid;
			data.list_count = parsed.entries.len() as u16;
			data.timeout = parsed.timeout_units;
			for uid in &parsed.entries {
				data.hash.insert(*uid);
			}
		}
		self.ec.advance();
		Ok(true)
	}

	/// Opens (creating on demand) and locks the log file.
	pub(crate) fn open_log(&self, data: &mut AuditData) -> KResult<()> {
		if data.log.is_some() {
			return Ok(());
		}
		let uid = match self.names.resolve(LOG_PATH) {
			Ok(uid) => uid,
			Err(Status::NameNotFound) => self.names.cr_file(LOG_PATH)?,
			Err(status) => return Err(status),
		};
		self.names.set_type(uid, Uid::NIL)?;
		let file_offset = self.names.file_len(uid)?;
		let lock_id = self.names.priv_lock(uid)?;
		let path = self.names.path_of(uid)?;
		match LogFile::open(&path, uid, lock_id, file_offset) {
			Ok(log) => {
				data.log = Some(log);
				Ok(())
			}
			Err(status) => {
				let _ = self.names.priv_unlock(uid, lock_id);
				Err(status)
			}
		}
	}

	/// Flushes, truncates and unlocks the log file.
	pub(crate) fn close_log(&self, data: &mut AuditData) -> KResult<()> {
		let Some(mut log) = data.log.take() else {
			return Ok(());
		};
		log.dirty = false;
		log.flush()?;
		log.truncate_to_end()?;
		self.names.priv_unlock(log.uid, log.lock_id)?;
		Ok(())
	}

	/// Suspends auditing of the calling process. Suspensions nest.
	pub fn suspend(&self) {
		let pid = proc1::current() as usize;
		self.suspend.lock().unwrap()[pid] += 1;
	}

	/// Resumes auditing of the calling process.
	pub fn resume(&self) {
		let pid = proc1::current() as usize;
		self.suspend.lock().unwrap()[pid] -= 1;
	}

	/// Copies the suspension state of `parent` to a new child.
	pub fn inherit(&self, parent: Pid, child: Pid) {
		let mut suspend = self.suspend.lock().unwrap();
		suspend[child as usize] = suspend[parent as usize];
	}

	/// Tells whether the calling process is audited.
	pub fn is_process_audited(&self) -> bool {
		let pid = proc1::current() as usize;
		self.suspend.lock().unwrap()[pid] == 0
	}

	/// Returns the Unix-level IDs recorded in event headers. Only the PID
	/// is meaningful for ASID 0.
	fn current_ids(&self) -> (u16, u16) {
		if proc1::as_id() == 0 {
			return (0, 0);
		}
		match self.proc2.get().and_then(Weak::upgrade) {
			Some(proc2) => {
				let (upid, upgid, _) = proc2.get_my_upids();
				(upid, upgid)
			}
			None => (0, 0),
		}
	}

	/// Logs an event under the calling process's identity.
	pub fn log_event(&self, event_uid: Uid, event_flags: u16, status: u32, data: &[u8]) {
		if !self.is_enabled() {
			return;
		}
		let (upid, upgid) = self.current_ids();
		self.log_event_ids(event_uid, event_flags, status, data, upid, upgid);
	}

	/// Logs an event with the Unix-level IDs supplied by the caller.
	///
	/// This is the entry used from under the process-table lock, where the
	/// IDs cannot be looked up without re-entering it.
	pub(crate) fn log_event_ids(
		&self,
		event_uid: Uid,
		event_flags: u16,
		status: u32,
		data: &[u8],
		upid: u16,
		upgid: u16,
	) {
		if !self.is_enabled() {
			return;
		}
		let Ok(sid) = self.acl.get_pid_sid(proc1::current()) else {
			return;
		};
		self.log_event_s_ids(
			event_uid,
			event_flags,
			&sid.to_bytes(),
			status,
			data,
			upid,
			upgid,
		);
	}

	/// Logs an event with an explicit SID.
	pub fn log_event_s(
		&self,
		event_uid: Uid,
		event_flags: u16,
		sid: &[u8; 36],
		status: u32,
		data: &[u8],
	) {
		if !self.is_enabled() {
			return;
		}
		let (upid, upgid) = self.current_ids();
		self.log_event_s_ids(event_uid, event_flags, sid, status, data, upid, upgid);
	}

	#[allow(clippy::too_many_arguments)]
	fn log_event_s_ids(
		&self,
		event_uid: Uid,
		event_flags: u16,
		sid: &[u8; 36],
		status: u32,
		data: &[u8],
		upid: u16,
		upgid: u16,
	) {
		if !self.is_enabled() {
			return;
		}
		let pid = proc1::current();
		{
			let mut suspend = self.suspend.lock().unwrap();
			if suspend[pid as usize] != 0 {
				return;
			}
			// The write path must not audit itself
			suspend[pid as usize] += 1;
		}
		let result =
			self.log_event_inner(event_uid, event_flags, sid, status, data, upid, upgid);
		if let Err(status) = result {
			// Recover by cycling the log; an unrecoverable log is fatal
			self.acl.enter_super();
			let recovered = {
				let mut guard = self.exclusion();
				self.close_log(&mut guard)
					.and_then(|()| self.open_log(&mut guard))
			};
			self.acl.exit_super();
			if recovered.is_err() {
				crash_system(status);
			}
		}
		self.suspend.lock().unwrap()[pid as usize] -= 1;
	}

	#[allow(clippy::too_many_arguments)]
	fn log_event_inner(
		&self,
		event_uid: Uid,
		event_flags: u16,
		sid: &[u8; 36],
		status: u32,
		data: &[u8],
		upid: u16,
		upgid: u16,
	) -> KResult<()> {
		let len = data.len().min(MAX_DATA_SIZE);
		let data = &data[..len];
		let mut guard = self.exclusion();
		if guard.flags.contains(ListFlags::SELECTIVE)
			&& !self.is_corrupted()
			&& !guard.hash.contains(event_uid)
		{
			return Ok(());
		}
		let record_size = EventRecord::size_for(len);
		{
			let Some(log) = guard.log.as_mut() else {
				return Ok(());
			};
			if (record_size as usize) > log.bytes_remaining {
				self.acl.enter_super();
				log.dirty = false;
				let remapped = log.remap();
				self.acl.exit_super();
				remapped?;
			}
		}
		let record = EventRecord {
			record_size,
			version: 1,
			sid: *sid,
			event_flags,
			node_id: NODE_ID << 12,
			event_uid,
			status,
			timestamp: time::clock().high,
			process_id: proc1::current(),
			upid,
			upgid,
			data: data.to_vec(),
		};
		let log = guard.log.as_mut().unwrap();
		log.append(&record);
		Ok(())
	}

	/// Reads the logical log image, for inspection and tests.
	pub fn read_log(&self) -> KResult<Vec<u8>> {
		let mut guard = self.exclusion();
		match guard.log.as_mut() {
			Some(log) => log.read_image(),
			None => {
				drop(guard);
				let uid = self.names.resolve(LOG_PATH)?;
				let path = self.names.path_of(uid)?;
				Ok(std::fs::read(path)?)
			}
		}
	}

	/// Logical end offset of the log.
	pub fn log_len(&self) -> u64 {
		self.exclusion()
			.log
			.as_ref()
			.map(|log| log.logical_end())
			.unwrap_or(0)
	}

	/// Tells whether the caller administers the audit subsystem.
	pub fn administrator(&self) -> KResult<bool> {
		let uid = self
			.names
			.resolve(ADMIN_PATH)
			.map_err(|_| Status::AuditFileNotFound)?;
		Ok(self.acl.rights(uid) == RIGHTS_ADMIN)
	}

	/// Runs a control operation. Everything except the self-suspension
	/// pair requires audit administrator rights.
	pub fn control(self: &Arc<Self>, cmd: Control) -> KResult<bool> {
		match cmd {
			Control::SuspendSelf => {
				self.suspend();
				return Ok(true);
			}
			Control::ResumeSelf => {
				self.resume();
				return Ok(true);
			}
			_ => {}
		}
		if !self.administrator()? {
			return Err(Status::NotAdministrator);
		}
		match cmd {
			Control::LoadList => self.load_list().map(|_| true),
			Control::Flush => {
				let mut guard = self.exclusion();
				match guard.log.as_mut() {
					Some(log) => {
						log.dirty = false;
						log.flush()?;
						Ok(true)
					}
					None => Err(Status::NotEnabled),
				}
			}
			Control::Start => self.start_logging().map(|()| true),
			Control::Stop => self.stop_logging().map(|()| true),
			Control::IsEnabled => Ok(self.is_enabled()),
			Control::SuspendSelf | Control::ResumeSelf => unreachable!(),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	pub(crate) fn audit_at(root: &std::path::Path) -> Arc<Audit> {
		let acl = Arc::new(Acl::new());
		let names = Arc::new(Names::new(root));
		let proc1 = Arc::new(Proc1::new());
		Arc::new(Audit::new(acl, names, proc1))
	}

	fn write_list(root: &std::path::Path, list: &AuditList) {
		let dir = root.join("node_data/audit");
		std::fs::create_dir_all(&dir).unwrap();
		std::fs::write(dir.join("audit_list"), list.to_bytes()).unwrap();
	}

	#[test]
	fn suspension_nests() {
		let dir = tempfile::tempdir().unwrap();
		let audit = audit_at(dir.path());
		assert!(audit.is_process_audited());
		audit.suspend();
		audit.suspend();
		assert!(!audit.is_process_audited());
		audit.resume();
		assert!(!audit.is_process_audited());
		audit.resume();
		assert!(audit.is_process_audited());
	}

	#[test]
	fn inherit_copies_counter() {
		let dir = tempfile::tempdir().unwrap();
		let audit = audit_at(dir.path());
		audit.suspend();
		audit.inherit(proc1::current(), 9);
		let suspend = audit.suspend.lock().unwrap();
		assert_eq!(suspend[9], 1);
	}

	#[test]
	fn start_requires_not_started() {
		let dir = tempfile::tempdir().unwrap();
		let audit = audit_at(dir.path());
		write_list(
			dir.path(),
			&AuditList {
				list_uid: Uid::generate(),
				timeout_units: 0,
				flags: ListFlags::empty(),
				entries: vec![],
			},
		);
		audit.start_logging().unwrap();
		assert!(audit.is_enabled());
		assert_eq!(
			audit.start_logging(),
			Err(Status::EventLoggingAlreadyStarted)
		);
		audit.stop_logging().unwrap();
		assert_eq!(
			audit.stop_logging(),
			Err(Status::EventLoggingAlreadyStopped)
		);
	}

	#[test]
	fn missing_list_disables_selective() {
		let dir = tempfile::tempdir().unwrap();
		let audit = audit_at(dir.path());
		assert_eq!(audit.load_list(), Ok(false));
		assert_eq!(audit.exclusion().flags, ListFlags::empty());
	}

	#[test]
	fn selective_filter() {
		let dir = tempfile::tempdir().unwrap();
		let audit = audit_at(dir.path());
		let listed = Uid::generate();
		let unlisted = Uid::generate();
		write_list(
			dir.path(),
			&AuditList {
				list_uid: Uid::generate(),
				timeout_units: 0,
				flags: ListFlags::SELECTIVE,
				entries: vec![listed],
			},
		);
		audit.start_logging().unwrap();
		let len0 = audit.log_len();
		audit.log_event(unlisted, 0, 0, b"dropped");
		assert_eq!(audit.log_len(), len0);
		audit.log_event(listed, 0, 0, b"kept!");
		assert!(audit.log_len() > len0);
		let records = EventRecord::decode_all(&audit.read_log().unwrap());
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].event_uid, listed);
		assert_eq!(records[0].data, b"kept!");
	}
}
