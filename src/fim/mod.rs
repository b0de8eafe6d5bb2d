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

//! Fault/Interrupt Manager.
//!
//! The FIM owns the per-address-space synchronous fault state: whether the
//! space is currently handling a fault, where its user-mode fault handler
//! lives, the cleanup-handler stack, trace-fault state, and the quit
//! eventcount user code waits on to observe asynchronous signals.
//!
//! Fault delivery hands a [`frame::DeliveryFrame`] to the space's user
//! handler; an address space with no handler installed crashes the system on
//! its first fault.

pub mod cleanup;
pub mod frame;

use crate::{
	ec::Eventcount,
	mst::{Asid, MAX_ASIDS},
	status::{crash_system, KResult, Status},
};
use cleanup::{CleanupGuard, CleanupHandler, CleanupRecord};
use frame::{DeliveryFrame, ExceptionFrame};
use std::{
	collections::VecDeque,
	sync::{
		atomic::{AtomicU32, AtomicU8, Ordering},
		Mutex,
	},
};

/// Access violation status reported when a fault cannot be delivered.
const ACCESS_VIOLATION: Status = Status::External(0x0092_0019);

/// High bit of the trace status, marking a signal rendezvous.
pub const TRACE_STS_SIGNAL: u32 = 0x80;

/// The fault/interrupt manager.
pub struct Fim {
	/// Per-space "handling a fault" flags.
	in_fim: [AtomicU8; MAX_ASIDS],
	/// Per-space user fault handler; 0 means crash on fault.
	user_fim_addr: [AtomicU32; MAX_ASIDS],
	/// Per-space re-entrant delivery gates.
	quit_inhibit: [AtomicU8; MAX_ASIDS],
	/// Per-space trace fault status.
	trace_status: [AtomicU32; MAX_ASIDS],
	/// Per-space pending trace bit (0x80 when armed).
	trace_bit: [AtomicU8; MAX_ASIDS],
	/// Number of spaces with an armed trace bit. While non-zero, the
	/// return-to-user path checks trace bits.
	pending_trace_faults: AtomicU32,
	/// Per-space quit eventcounts.
	quit_ecs: Vec<Eventcount>,
	/// Per-space cleanup handler stacks.
	cleanup: Mutex<Vec<Vec<CleanupRecord>>>,
	/// Per-space queues of frames delivered to user mode.
	delivered: Mutex<Vec<VecDeque<DeliveryFrame>>>,
}

impl Fim {
	pub fn new() -> Self {
		Self {
			in_fim: std::array::from_fn(|_| AtomicU8::new(0)),
			user_fim_addr: std::array::from_fn(|_| AtomicU32::new(0)),
			quit_inhibit: std::array::from_fn(|_| AtomicU8::new(0)),
			trace_status: std::array::from_fn(|_| AtomicU32::new(0)),
			trace_bit: std::array::from_fn(|_| AtomicU8::new(0)),
			pending_trace_faults: AtomicU32::new(0),
			quit_ecs: (0..MAX_ASIDS).map(|_| Eventcount::new()).collect(),
			cleanup: Mutex::new((0..MAX_ASIDS).map(|_| Vec::new()).collect()),
			delivered: Mutex::new((0..MAX_ASIDS).map(|_| VecDeque::new()).collect()),
		}
	}

	/// Returns the quit eventcount of an address space.
	pub fn quit_ec(&self, asid: Asid) -> &Eventcount {
		&self.quit_ecs[asid as usize]
	}

	/// Tells whether signal delivery is inhibited for the space.
	pub fn quit_inhibit(&self, asid: Asid) -> bool {
		self.quit_inhibit[asid as usize].load(Ordering::SeqCst) != 0
	}

	/// Gates or ungates signal delivery for the space.
	pub fn set_quit_inhibit(&self, asid: Asid, inhibit: bool) {
		self.quit_inhibit[asid as usize].store(u8::from(inhibit), Ordering::SeqCst);
	}

	/// Returns the trace status of the space.
	pub fn trace_status(&self, asid: Asid) -> u32 {
		self.trace_status[asid as usize].load(Ordering::SeqCst)
	}

	/// Sets the trace status of the space.
	pub fn set_trace_status(&self, asid: Asid, status: u32) {
		self.trace_status[asid as usize].store(status, Ordering::SeqCst);
	}

	/// Returns the user fault handler of the space.
	pub fn user_fim_addr(&self, asid: Asid) -> u32 {
		self.user_fim_addr[asid as usize].load(Ordering::SeqCst)
	}

	/// Installs the user fault handler of the space.
	pub fn set_user_fim_addr(&self, asid: Asid, addr: u32) {
		self.user_fim_addr[asid as usize].store(addr, Ordering::SeqCst);
	}

	/// Copies the user handler from one space to another, ungating delivery
	/// on the destination when a handler is present.
	pub fn copy_user_fim_addr(&self, from: Asid, to: Asid) {
		let addr = self.user_fim_addr(from);
		self.set_user_fim_addr(to, addr);
		if addr != 0 {
			self.set_quit_inhibit(to, false);
		}
	}

	/// Resets the floating-point state of the space.
	pub fn fp_init(&self, _asid: Asid) {}

	/// Pushes a cleanup record for the space; the guard pops it on drop.
	pub fn push_cleanup(&self, asid: Asid, tag: u32, handler: CleanupHandler) -> CleanupGuard<'_> {
		self.cleanup.lock().unwrap()[asid as usize].push(CleanupRecord::new(tag, handler));
		CleanupGuard::new(self, asid)
	}

	/// Pops the top cleanup record of the space.
	pub fn pop_cleanup(&self, asid: Asid) -> Option<CleanupRecord> {
		self.cleanup.lock().unwrap()[asid as usize].pop()
	}

	/// Returns the cleanup stack depth of the space.
	pub fn cleanup_depth(&self, asid: Asid) -> usize {
		self.cleanup.lock().unwrap()[asid as usize].len()
	}

	/// Drops every cleanup record of the space.
	pub fn drain_cleanup(&self, asid: Asid) {
		self.cleanup.lock().unwrap()[asid as usize].clear();
	}

	/// Records a pending trace fault for the space.
	///
	/// The return-to-user path delivers it exactly once; arming keeps the
	/// global pending count non-zero so that path stays live.
	pub fn single_step(&self, asid: Asid, status: u32) {
		self.set_trace_status(asid, status);
		let prev = self.trace_bit[asid as usize].swap(0x80, Ordering::SeqCst);
		if prev == 0 {
			self.pending_trace_faults.fetch_add(1, Ordering::SeqCst);
		}
	}

	/// Number of spaces with an armed trace bit.
	pub fn pending_trace_faults(&self) -> u32 {
		self.pending_trace_faults.load(Ordering::SeqCst)
	}

	/// Consumes the space's trace bit and delivers a trace-flavored frame.
	pub fn deliver_trace_fault(&self, asid: Asid) {
		let prev = self.trace_bit[asid as usize].swap(0, Ordering::SeqCst);
		if prev != 0 {
			self.pending_trace_faults.fetch_sub(1, Ordering::SeqCst);
		}
		let status = self.trace_status(asid);
		self.delivered.lock().unwrap()[asid as usize].push_back(DeliveryFrame::trace(status));
	}

	/// Builds and delivers a fault frame to the space's user handler.
	///
	/// A nested fault (the space is already in the FIM) is fatal. A
	/// recoverable fault with a cleanup handler installed runs the top
	/// record instead and reports [`Status::CleanupSet`] to the caller. A
	/// fault with no user handler crashes the system.
	///
	/// On delivery, the exception frame's PC is redirected to the user
	/// handler and the frame queues on the space's delivered list.
	pub fn build_delivery_frame(
		&self,
		asid: Asid,
		exc: &mut ExceptionFrame,
		status: u32,
	) -> KResult<()> {
		let was = self.in_fim[asid as usize].swap(0xFF, Ordering::SeqCst);
		if was != 0 {
			crash_system(Status::InternalError);
		}
		if exc.is_recoverable() {
			if let Some(mut record) = self.pop_cleanup(asid) {
				(record.handler)(exc);
				self.in_fim[asid as usize].store(0, Ordering::SeqCst);
				return Err(Status::CleanupSet);
			}
		}
		let handler = self.user_fim_addr(asid);
		if handler == 0 {
			crash_system(ACCESS_VIOLATION);
		}
		self.delivered.lock().unwrap()[asid as usize]
			.push_back(DeliveryFrame::fault(exc, status));
		exc.pc = handler;
		Ok(())
	}

	/// Completes a delivery attempt that found no signal, re-arming the
	/// delivery gate.
	pub fn advance_signal_delivery(&self, asid: Asid) {
		self.set_quit_inhibit(asid, false);
	}

	/// Returns from fault or signal handling to the interrupted context.
	pub fn fault_return(&self, asid: Asid) {
		self.in_fim[asid as usize].store(0, Ordering::SeqCst);
		self.set_quit_inhibit(asid, false);
	}

	/// Drains the frames delivered to the space.
	pub fn take_delivered(&self, asid: Asid) -> Vec<DeliveryFrame> {
		self.delivered.lock().unwrap()[asid as usize].drain(..).collect()
	}
}

impl Default for Fim {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use frame::DeliveryKind;

	#[test]
	fn trace_fault_once() {
		let fim = Fim::new();
		fim.single_step(4, 0x11);
		fim.single_step(4, 0x12);
		assert_eq!(fim.pending_trace_faults(), 1);
		fim.deliver_trace_fault(4);
		assert_eq!(fim.pending_trace_faults(), 0);
		let frames = fim.take_delivered(4);
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].kind, DeliveryKind::Trace);
		assert_eq!(frames[0].status, 0x12);
	}

	#[test]
	fn delivery_redirects_pc() {
		let fim = Fim::new();
		fim.set_user_fim_addr(5, 0x4000);
		let mut exc = ExceptionFrame {
			pc: 0x1234,
			fault_addr: 0x10,
			..Default::default()
		};
		fim.build_delivery_frame(5, &mut exc, 0x42).unwrap();
		assert_eq!(exc.pc, 0x4000);
		let frames = fim.take_delivered(5);
		assert_eq!(frames[0].magic, frame::DF_MAGIC);
		assert_eq!(frames[0].status, 0x42);
		fim.fault_return(5);
	}

	#[test]
	fn recoverable_fault_runs_cleanup() {
		let fim = Fim::new();
		fim.set_user_fim_addr(6, 0x4000);
		let guard = fim.push_cleanup(6, 1, Box::new(|_| {}));
		let mut exc = ExceptionFrame {
			fault_addr: frame::RECOVERABLE_ADDR,
			..Default::default()
		};
		let res = fim.build_delivery_frame(6, &mut exc, 0);
		assert_eq!(res, Err(Status::CleanupSet));
		// The fault consumed the record; nothing is delivered
		assert!(fim.take_delivered(6).is_empty());
		assert!(guard.release().is_none());
	}
}
