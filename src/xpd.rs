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

//! Cross-process debug shim.
//!
//! XPD holds the ptrace option blocks of debugged processes, decides whether
//! children inherit them, and may capture a fault before it is delivered to
//! the faulting process's handler.

use crate::status::KResult;
use std::sync::{
	atomic::{AtomicBool, Ordering},
	Mutex,
};

/// Ptrace option block of a debugged process.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PtraceOpts {
	pub opts: [u32; 3],
	pub flags: u16,
}

/// A recorded debug-state write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct XpdWrite {
	pub addr: u32,
	pub offset: u32,
}

type CaptureHook = Box<dyn Fn(u16, u32) -> (u16, u32) + Send>;

/// The cross-process debug layer.
#[derive(Default)]
pub struct Xpd {
	inherit: AtomicBool,
	writes: Mutex<Vec<XpdWrite>>,
	capture: Mutex<Option<CaptureHook>>,
}

impl Xpd {
	pub fn new() -> Self {
		Self::default()
	}

	/// Resets a ptrace option block to its attach defaults.
	pub fn reset_ptrace_opts(&self, opts: &mut PtraceOpts) {
		*opts = PtraceOpts::default();
	}

	/// Tells whether a child of a debugged process inherits its parent's
	/// ptrace options.
	pub fn inherit_ptrace_options(&self) -> bool {
		self.inherit.load(Ordering::Relaxed)
	}

	/// Turns ptrace inheritance on or off.
	pub fn set_inherit(&self, inherit: bool) {
		self.inherit.store(inherit, Ordering::Relaxed);
	}

	/// Records a debug-state write into the target's stack context.
	pub fn write(&self, addr: u32, offset: u32) -> KResult<()> {
		self.writes.lock().unwrap().push(XpdWrite {
			addr,
			offset,
		});
		Ok(())
	}

	/// Returns the recorded debug-state writes.
	pub fn writes(&self) -> Vec<XpdWrite> {
		self.writes.lock().unwrap().clone()
	}

	/// Offers a fault to the debugger before delivery. Returns the possibly
	/// rewritten `(signal, status)`; a signal of `0` swallows the fault.
	pub fn capture_fault(&self, signal: u16, status: u32) -> (u16, u32) {
		match &*self.capture.lock().unwrap() {
			Some(hook) => hook(signal, status),
			None => (signal, status),
		}
	}

	/// Installs the fault-capture hook.
	pub fn set_capture(&self, hook: Option<CaptureHook>) {
		*self.capture.lock().unwrap() = hook;
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn capture_default_is_identity() {
		let xpd = Xpd::new();
		assert_eq!(xpd.capture_fault(11, 0x42), (11, 0x42));
	}

	#[test]
	fn capture_hook_rewrites() {
		let xpd = Xpd::new();
		xpd.set_capture(Some(Box::new(|_, _| (0, 0))));
		assert_eq!(xpd.capture_fault(11, 0x42), (0, 0));
	}

	#[test]
	fn writes_recorded() {
		let xpd = Xpd::new();
		xpd.write(0x1000, 0x90).unwrap();
		assert_eq!(
			xpd.writes(),
			vec![XpdWrite {
				addr: 0x1000,
				offset: 0x90
			}]
		);
	}
}
