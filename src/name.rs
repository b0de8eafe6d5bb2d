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

//! Naming and file shim.
//!
//! Kernel paths such as `//node_data/audit/audit_log` resolve to files under
//! a per-kernel root directory. Resolution assigns each file a UID; the file
//! surface (flush, truncate, attributes, locks) addresses files by UID.

use crate::{
	mst::Asid,
	status::{KResult, Status},
	uid::Uid,
};
use std::{
	collections::HashMap,
	fs,
	fs::OpenOptions,
	path::{Path, PathBuf},
	sync::Mutex,
};

struct Inner {
	by_path: HashMap<PathBuf, Uid>,
	by_uid: HashMap<Uid, PathBuf>,
	locks: HashMap<Uid, u32>,
	next_lock: u32,
}

/// The naming layer.
pub struct Names {
	root: PathBuf,
	inner: Mutex<Inner>,
}

impl Names {
	/// Creates the layer resolving `//...` paths under `root`.
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self {
			root: root.into(),
			inner: Mutex::new(Inner {
				by_path: HashMap::new(),
				by_uid: HashMap::new(),
				locks: HashMap::new(),
				next_lock: 1,
			}),
		}
	}

	fn host_path(&self, path: &str) -> PathBuf {
		self.root.join(path.trim_start_matches('/'))
	}

	fn intern(&self, host: PathBuf) -> Uid {
		let mut inner = self.inner.lock().unwrap();
		if let Some(uid) = inner.by_path.get(&host) {
			return *uid;
		}
		let uid = Uid::generate();
		inner.by_path.insert(host.clone(), uid);
		inner.by_uid.insert(uid, host);
		uid
	}

	/// Resolves a pathname to the UID of an existing object.
	pub fn resolve(&self, path: &str) -> KResult<Uid> {
		let host = self.host_path(path);
		if !host.exists() {
			return Err(Status::NameNotFound);
		}
		Ok(self.intern(host))
	}

	/// Creates a file and returns its UID.
	pub fn cr_file(&self, path: &str) -> KResult<Uid> {
		let host = self.host_path(path);
		if let Some(parent) = host.parent() {
			fs::create_dir_all(parent)?;
		}
		OpenOptions::new().create(true).append(true).open(&host)?;
		Ok(self.intern(host))
	}

	/// Returns the host path backing a UID.
	pub fn path_of(&self, uid: Uid) -> KResult<PathBuf> {
		self.inner
			.lock()
			.unwrap()
			.by_uid
			.get(&uid)
			.cloned()
			.ok_or(Status::NameNotFound)
	}

	/// Sets up naming state for a new address space.
	pub fn init_asid(&self, _asid: Asid) -> KResult<()> {
		Ok(())
	}

	/// Clones naming state from the caller's address space into the child's.
	pub fn fork(&self, _parent: Asid, _child: Asid) -> KResult<()> {
		Ok(())
	}

	/// Flushes a file's dirty pages to backing store.
	pub fn fw_file(&self, uid: Uid) -> KResult<()> {
		let path = self.path_of(uid)?;
		let file = OpenOptions::new().write(true).open(path)?;
		file.sync_all()?;
		Ok(())
	}

	/// Sets a file's type. Unstructured files carry no extra state here.
	pub fn set_type(&self, uid: Uid, _type_uid: Uid) -> KResult<()> {
		self.path_of(uid).map(|_| ())
	}

	/// Returns the current length of the file.
	pub fn file_len(&self, uid: Uid) -> KResult<u64> {
		let path = self.path_of(uid)?;
		Ok(fs::metadata(path)?.len())
	}

	/// Truncates the file to `len` bytes.
	pub fn truncate(&self, uid: Uid, len: u64) -> KResult<()> {
		let path = self.path_of(uid)?;
		let file = OpenOptions::new().write(true).open(path)?;
		file.set_len(len)?;
		Ok(())
	}

	/// Takes the single-holder file lock; returns the lock ID.
	pub fn priv_lock(&self, uid: Uid) -> KResult<u32> {
		let mut inner = self.inner.lock().unwrap();
		if inner.locks.contains_key(&uid) {
			return Err(Status::FileIo);
		}
		let id = inner.next_lock;
		inner.next_lock += 1;
		inner.locks.insert(uid, id);
		Ok(id)
	}

	/// Releases the file lock.
	pub fn priv_unlock(&self, uid: Uid, lock_id: u32) -> KResult<()> {
		let mut inner = self.inner.lock().unwrap();
		match inner.locks.get(&uid) {
			Some(&id) if id == lock_id => {
				inner.locks.remove(&uid);
				Ok(())
			}
			_ => Err(Status::FileIo),
		}
	}

	/// Locks the caller's open files for a fork.
	pub fn fork_lock(&self, _asid: Asid) -> KResult<()> {
		Ok(())
	}

	/// Drops every file lock held on behalf of an address space.
	pub fn priv_unlock_all(&self, _asid: Asid) {}

	/// Returns the root directory the layer resolves under.
	pub fn root(&self) -> &Path {
		&self.root
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn resolve_missing_is_name_not_found() {
		let dir = tempfile::tempdir().unwrap();
		let names = Names::new(dir.path());
		assert_eq!(
			names.resolve("//node_data/audit/audit_list"),
			Err(Status::NameNotFound)
		);
	}

	#[test]
	fn cr_file_then_resolve() {
		let dir = tempfile::tempdir().unwrap();
		let names = Names::new(dir.path());
		let uid = names.cr_file("//node_data/audit/audit_log").unwrap();
		let again = names.resolve("//node_data/audit/audit_log").unwrap();
		assert_eq!(uid, again);
		assert_eq!(names.file_len(uid).unwrap(), 0);
	}

	#[test]
	fn priv_lock_single_holder() {
		let dir = tempfile::tempdir().unwrap();
		let names = Names::new(dir.path());
		let uid = names.cr_file("//node_data/x").unwrap();
		let id = names.priv_lock(uid).unwrap();
		assert!(names.priv_lock(uid).is_err());
		names.priv_unlock(uid, id).unwrap();
		names.priv_lock(uid).unwrap();
	}
}
