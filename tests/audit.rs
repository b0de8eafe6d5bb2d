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

//! Audit subsystem scenarios: selective logging, the corrupted fallback,
//! buffer wrap, control operations.

use byteorder::{ByteOrder, LittleEndian};
use kernel::{
	audit::{
		list::{AuditList, ListFlags},
		log::EventRecord,
		Control,
	},
	status::Status,
	uid::Uid,
	Kernel,
};
use std::path::Path;

fn write_list(root: &Path, list: &AuditList) {
	let dir = root.join("node_data/audit");
	std::fs::create_dir_all(&dir).unwrap();
	std::fs::write(dir.join("audit_list"), list.to_bytes()).unwrap();
}

fn selective_list(entries: Vec<Uid>) -> AuditList {
	AuditList {
		list_uid: Uid::generate(),
		timeout_units: 0,
		flags: ListFlags::SELECTIVE,
		entries,
	}
}

#[test]
fn event_roundtrip_field_for_field() {
	let dir = tempfile::tempdir().unwrap();
	write_list(
		dir.path(),
		&AuditList {
			list_uid: Uid::generate(),
			timeout_units: 0,
			flags: ListFlags::empty(),
			entries: vec![],
		},
	);
	let kernel = Kernel::boot(dir.path().to_path_buf());
	assert!(kernel.audit.is_enabled());
	assert!(!kernel.audit.is_corrupted());
	let event_uid = Uid::generate();
	let data = [0x41u8; 33];
	kernel.audit.log_event(event_uid, 5, 0x0019_000D, &data);
	let records = EventRecord::decode_all(&kernel.audit.read_log().unwrap());
	assert_eq!(records.len(), 1);
	let r = &records[0];
	assert_eq!(r.record_size, EventRecord::size_for(data.len()));
	// round_up_even(0x47 + 33)
	assert_eq!(r.record_size, 0x68);
	assert_eq!(r.version, 1);
	assert_eq!(r.event_flags, 5);
	assert_eq!(r.event_uid, event_uid);
	assert_eq!(r.status, 0x0019_000D);
	assert_eq!(r.node_id >> 12, 1);
	assert_eq!(r.process_id, 1);
	assert_eq!(r.upid, 1);
	assert_eq!(r.data, data);
	kernel.audit.stop_logging().unwrap();
}

#[test]
fn selective_then_corrupted() {
	// Pass 1: selective list with U1 only; U2 is dropped
	let dir = tempfile::tempdir().unwrap();
	let u1 = Uid::generate();
	let u2 = Uid::generate();
	write_list(dir.path(), &selective_list(vec![u1]));
	{
		let kernel = Kernel::boot(dir.path().to_path_buf());
		assert!(kernel.audit.is_enabled());
		kernel.audit.log_event(u1, 0, 0, b"one");
		kernel.audit.log_event(u2, 0, 0, b"two");
		let records = EventRecord::decode_all(&kernel.audit.read_log().unwrap());
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].event_uid, u1);
		kernel.audit.stop_logging().unwrap();
	}
	// Pass 2: a list from the future corrupts the subsystem; everything
	// is logged regardless of selectivity
	let dir = tempfile::tempdir().unwrap();
	let mut bytes = selective_list(vec![u1]).to_bytes();
	LittleEndian::write_u16(&mut bytes[0x0A..], 2);
	let audit_dir = dir.path().join("node_data/audit");
	std::fs::create_dir_all(&audit_dir).unwrap();
	std::fs::write(audit_dir.join("audit_list"), bytes).unwrap();
	{
		let kernel = Kernel::boot(dir.path().to_path_buf());
		assert!(kernel.audit.is_corrupted());
		assert!(kernel.audit.is_enabled());
		kernel.audit.log_event(u1, 0, 0, b"one");
		kernel.audit.log_event(u2, 0, 0, b"two");
		let records = EventRecord::decode_all(&kernel.audit.read_log().unwrap());
		assert_eq!(records.len(), 2);
		assert_eq!(records[1].event_uid, u2);
		kernel.audit.stop_logging().unwrap();
	}
}

#[test]
fn selectivity_leaves_log_length_unchanged() {
	let dir = tempfile::tempdir().unwrap();
	let listed = Uid::generate();
	write_list(dir.path(), &selective_list(vec![listed]));
	let kernel = Kernel::boot(dir.path().to_path_buf());
	kernel.audit.log_event(listed, 0, 0, b"xyz");
	let len = kernel.audit.log_len();
	kernel.audit.log_event(Uid::generate(), 0, 0, b"dropped");
	assert_eq!(kernel.audit.log_len(), len);
	kernel.audit.stop_logging().unwrap();
}

#[test]
fn buffer_wrap_remaps_window() {
	let dir = tempfile::tempdir().unwrap();
	write_list(
		dir.path(),
		&AuditList {
			list_uid: Uid::generate(),
			timeout_units: 0,
			flags: ListFlags::empty(),
			entries: vec![],
		},
	);
	let kernel = Kernel::boot(dir.path().to_path_buf());
	let event_uid = Uid::generate();
	// 0x846-byte records: fifteen fit in the 32 KiB window, the sixteenth
	// forces a remap at the advanced file offset
	let data = vec![0x5A_u8; 2047];
	let record_size = EventRecord::size_for(data.len()) as u64;
	assert_eq!(record_size, 0x846);
	for _ in 0..16 {
		kernel.audit.log_event(event_uid, 0, 0, &data);
	}
	assert_eq!(kernel.audit.log_len(), 16 * record_size);
	// The first window's worth reached the backing file
	let on_disk = std::fs::metadata(dir.path().join("node_data/audit/audit_log"))
		.unwrap()
		.len();
	assert!(on_disk >= 15 * record_size);
	let records = EventRecord::decode_all(&kernel.audit.read_log().unwrap());
	assert_eq!(records.len(), 16);
	assert!(records.iter().all(|r| r.data == data));
	kernel.audit.stop_logging().unwrap();
}

#[test]
fn stop_truncates_to_logical_end() {
	let dir = tempfile::tempdir().unwrap();
	write_list(
		dir.path(),
		&AuditList {
			list_uid: Uid::generate(),
			timeout_units: 0,
			flags: ListFlags::empty(),
			entries: vec![],
		},
	);
	let kernel = Kernel::boot(dir.path().to_path_buf());
	kernel.audit.log_event(Uid::generate(), 0, 0, b"abc");
	let len = kernel.audit.log_len();
	kernel.audit.stop_logging().unwrap();
	let on_disk = std::fs::metadata(dir.path().join("node_data/audit/audit_log"))
		.unwrap()
		.len();
	assert_eq!(on_disk, len);
}

#[test]
fn control_requires_administrator() {
	let dir = tempfile::tempdir().unwrap();
	write_list(
		dir.path(),
		&AuditList {
			list_uid: Uid::generate(),
			timeout_units: 0,
			flags: ListFlags::empty(),
			entries: vec![],
		},
	);
	let kernel = Kernel::boot(dir.path().to_path_buf());
	// Self-suspension needs no rights
	assert_eq!(kernel.audit.control(Control::SuspendSelf), Ok(true));
	assert!(!kernel.audit.is_process_audited());
	assert_eq!(kernel.audit.control(Control::ResumeSelf), Ok(true));
	assert_eq!(kernel.audit.control(Control::IsEnabled), Ok(true));
	assert_eq!(kernel.audit.control(Control::Flush), Ok(true));
	// Revoking the rights on //node_data/audit locks the controls out
	let audit_uid = kernel.names.resolve("//node_data/audit").unwrap();
	kernel.acl.set_rights(audit_uid, 0);
	assert_eq!(
		kernel.audit.control(Control::Stop),
		Err(Status::NotAdministrator)
	);
	kernel.acl.set_rights(audit_uid, 2);
	assert_eq!(kernel.audit.control(Control::Stop), Ok(true));
	assert_eq!(kernel.audit.control(Control::IsEnabled), Ok(false));
}

#[test]
fn suspended_process_not_logged() {
	let dir = tempfile::tempdir().unwrap();
	write_list(
		dir.path(),
		&AuditList {
			list_uid: Uid::generate(),
			timeout_units: 0,
			flags: ListFlags::empty(),
			entries: vec![],
		},
	);
	let kernel = Kernel::boot(dir.path().to_path_buf());
	kernel.audit.suspend();
	kernel.audit.log_event(Uid::generate(), 0, 0, b"silent");
	assert_eq!(kernel.audit.log_len(), 0);
	kernel.audit.resume();
	kernel.audit.log_event(Uid::generate(), 0, 0, b"heard");
	assert_ne!(kernel.audit.log_len(), 0);
	kernel.audit.stop_logging().unwrap();
}
