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

//! The process-management core of the kernel.
//!
//! Four subsystems cooperate here: the process manager (process table,
//! hierarchy, process groups, signals, fork and wait), the fault/interrupt
//! manager delivering synchronous faults and signals to user mode, the
//! security event log, and the low-level layers they consume (task
//! scheduling, address spaces, event counters, naming, access control).
//!
//! A [`Kernel`] value owns one instance of everything. Persistent state
//! (the audit log and list) lives under a `node_data` root directory given
//! at construction.

pub mod acl;
pub mod audit;
pub mod ec;
pub mod fim;
pub mod mst;
pub mod name;
pub mod proc1;
pub mod process;
pub mod status;
pub mod time;
pub mod uid;
pub mod xpd;

use crate::{
	acl::Acl,
	audit::Audit,
	fim::Fim,
	mst::Mst,
	name::Names,
	proc1::Proc1,
	process::Proc2,
	xpd::Xpd,
};
use std::{path::PathBuf, sync::Arc};

/// One instance of the kernel core.
pub struct Kernel {
	pub proc1: Arc<Proc1>,
	pub mst: Arc<Mst>,
	pub fim: Arc<Fim>,
	pub acl: Arc<Acl>,
	pub names: Arc<Names>,
	pub xpd: Arc<Xpd>,
	pub proc2: Arc<Proc2>,
	pub audit: Arc<Audit>,
}

impl Kernel {
	/// Builds and wires the subsystems. Nothing is started; the audit
	/// subsystem in particular stays silent until [`Kernel::boot`] or an
	/// explicit start.
	pub fn new(node_data_root: impl Into<PathBuf>) -> Self {
		let proc1 = Arc::new(Proc1::new());
		let mst = Arc::new(Mst::new());
		let fim = Arc::new(Fim::new());
		let acl = Arc::new(Acl::new());
		let names = Arc::new(Names::new(node_data_root));
		let xpd = Arc::new(Xpd::new());
		let proc2 = Arc::new(Proc2::new(
			proc1.clone(),
			mst.clone(),
			fim.clone(),
			acl.clone(),
			names.clone(),
			xpd.clone(),
		));
		let audit = Arc::new(Audit::new(acl.clone(), names.clone(), proc1.clone()));
		audit.set_proc2(Arc::downgrade(&proc2));
		proc2.set_audit(audit.clone());
		Self {
			proc1,
			mst,
			fim,
			acl,
			names,
			xpd,
			proc2,
			audit,
		}
	}

	/// Builds the kernel and initializes the audit subsystem, warnings and
	/// corrupted fallback included.
	pub fn boot(node_data_root: impl Into<PathBuf>) -> Self {
		let kernel = Self::new(node_data_root);
		kernel.audit.init();
		kernel
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn kernel_wires_up() {
		let dir = tempfile::tempdir().unwrap();
		let kernel = Kernel::new(dir.path());
		// The boot task is the init process
		assert_eq!(kernel.proc2.my_pid(), 1);
		assert!(!kernel.proc2.who_am_i().is_nil());
		assert!(!kernel.audit.is_enabled());
	}
}
