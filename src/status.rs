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

//! Kernel status codes.
//!
//! Every fallible kernel operation returns a [`Status`] on failure. A status
//! encodes the owning module in the high byte of its 32-bit code (PROC2 is
//! `0x19`, AUDIT is `0x30`) and the error in the low bytes. Failures caused
//! outside the calling module are wrapped in [`Status::External`], which sets
//! the high bit of the code.

use core::fmt;

/// Result type of kernel operations.
pub type KResult<T> = Result<T, Status>;

/// Module number of PROC2 status codes.
pub const MODULE_PROC2: u32 = 0x19;
/// Module number of AUDIT status codes.
pub const MODULE_AUDIT: u32 = 0x30;

/// A kernel status code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Status {
	/// The process table has no free slot.
	#[error("process table full")]
	TableFull,
	/// No process carries the requested UID.
	#[error("process UID not found")]
	UidNotFound,
	/// The target process is a zombie.
	#[error("process is a zombie")]
	Zombie,
	/// `complete_vfork` was called by a process that was not vforked.
	#[error("process wasn't vforked")]
	ProcessWasntVforked,
	/// A session leader tried to change its own process group.
	#[error("process is a process group leader")]
	ProcessIsGroupLeader,
	/// The requested session ID is in use as a process group ID.
	#[error("process is using the pgroup ID")]
	ProcessUsingPgroupId,
	/// The caller may not signal or modify the target.
	#[error("permission denied")]
	PermissionDenied,
	/// The caller has no children matching the wait selector.
	#[error("wait found no children")]
	WaitFoundNoChildren,
	/// The target process has no parent.
	#[error("process is already an orphan")]
	AlreadyOrphan,
	/// The caller is not the debugger of the target.
	#[error("process is not a debug target")]
	ProcNotDebugTarget,
	/// A fault signal is already pending on the target.
	#[error("another fault is pending")]
	AnotherFaultPending,
	/// The process group belongs to a different session.
	#[error("pgroup is in a different session")]
	PgroupInDifferentSession,
	/// The caller lacks the right to perform the operation.
	#[error("no right to perform operation")]
	NoRightToPerformOperation,
	/// Internal PROC2 invariant violation.
	#[error("PROC2 internal error")]
	InternalError,

	/// An eventcount wait was interrupted by an asynchronous fault.
	#[error("asynchronous fault while waiting")]
	AsyncFaultWhileWaiting,
	/// A cleanup handler ran in place of fault delivery.
	#[error("cleanup handler set")]
	CleanupSet,
	/// A pathname did not resolve.
	#[error("name not found")]
	NameNotFound,
	/// A file operation failed in the host layer.
	#[error("file I/O failure")]
	FileIo,

	/// The audit list holds more event types than supported.
	#[error("excessive event types")]
	ExcessiveEventTypes,
	/// Unknown audit control command.
	#[error("invalid audit command")]
	InvalidCommand,
	/// The caller is not an audit administrator.
	#[error("not an audit administrator")]
	NotAdministrator,
	/// An audit file is missing.
	#[error("audit file not found")]
	AuditFileNotFound,
	/// Audit logging is already started.
	#[error("event logging already started")]
	EventLoggingAlreadyStarted,
	/// Audit logging is already stopped.
	#[error("event logging already stopped")]
	EventLoggingAlreadyStopped,
	/// The audit list file version is newer than supported.
	#[error("event list not current format")]
	EventListNotCurrentFormat,
	/// Audit logging is not enabled.
	#[error("audit not enabled")]
	NotEnabled,

	/// A failure whose cause lies outside the reporting module. The inner
	/// value is the raw status code of the failing subsystem.
	#[error("external failure (status {0:#010x})")]
	External(u32),
}

impl Status {
	/// Returns the 32-bit status code.
	pub fn code(self) -> u32 {
		match self {
			Self::TableFull => 0x0019_0001,
			Self::UidNotFound => 0x0019_0002,
			Self::Zombie => 0x0019_0003,
			Self::ProcessWasntVforked => 0x0019_0004,
			Self::ProcessIsGroupLeader => 0x0019_0005,
			Self::ProcessUsingPgroupId => 0x0019_0006,
			Self::PermissionDenied => 0x0019_000A,
			Self::WaitFoundNoChildren => 0x0019_000D,
			Self::AlreadyOrphan => 0x0019_000E,
			Self::ProcNotDebugTarget => 0x0019_0010,
			Self::AnotherFaultPending => 0x0019_0012,
			Self::PgroupInDifferentSession => 0x0019_0017,
			Self::NoRightToPerformOperation => 0x0019_0018,
			Self::InternalError => 0x0019_00FF,

			Self::AsyncFaultWhileWaiting => 0x0018_0003,
			Self::CleanupSet => 0x0024_0002,
			Self::NameNotFound => 0x000e_0002,
			Self::FileIo => 0x000f_0013,

			Self::ExcessiveEventTypes => 0x0030_0003,
			Self::InvalidCommand => 0x0030_0007,
			Self::NotAdministrator => 0x0030_0008,
			Self::AuditFileNotFound => 0x0030_000C,
			Self::EventLoggingAlreadyStarted => 0x0030_000E,
			Self::EventLoggingAlreadyStopped => 0x0030_000F,
			Self::EventListNotCurrentFormat => 0x0030_0010,
			Self::NotEnabled => 0x0030_0011,

			Self::External(code) => code | 0x8000_0000,
		}
	}

	/// Returns the module number of the status code.
	pub fn module(self) -> u32 {
		(self.code() >> 16) & 0xFF
	}

	/// Wraps the status as an external cause unless it already belongs to
	/// PROC2.
	pub fn external(self) -> Status {
		if self.module() == MODULE_PROC2 {
			self
		} else {
			Self::External(self.code())
		}
	}
}

impl From<std::io::Error> for Status {
	fn from(_: std::io::Error) -> Self {
		Self::FileIo
	}
}

/// Halts the system after an unrecoverable invariant violation.
///
/// The status is reported before aborting so crash dumps stay attributable.
pub fn crash_system(status: Status) -> ! {
	log::error!("system crash: {status} (status {:#010x})", status.code());
	panic!("system crash: {}", CrashDisplay(status));
}

struct CrashDisplay(Status);

impl fmt::Display for CrashDisplay {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} (status {:#010x})", self.0, self.0.code())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn module_bytes() {
		assert_eq!(Status::WaitFoundNoChildren.code(), 0x0019_000D);
		assert_eq!(Status::PgroupInDifferentSession.code(), 0x0019_0017);
		assert_eq!(Status::AsyncFaultWhileWaiting.code(), 0x0018_0003);
		assert_eq!(Status::NotEnabled.module(), MODULE_AUDIT);
	}

	#[test]
	fn external_wrap() {
		// A PROC2 status passes through unchanged
		assert_eq!(Status::TableFull.external(), Status::TableFull);
		// Anything else gets the high bit
		let wrapped = Status::FileIo.external();
		assert_eq!(wrapped, Status::External(0x000f_0013));
		assert_eq!(wrapped.code(), 0x800f_0013);
	}
}
