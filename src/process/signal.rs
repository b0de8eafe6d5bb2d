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

//! Signal delivery core.
//!
//! Raising a signal records it in the target's pending set; delivery pushes
//! a trace-flavored fault through the FIM and advances the target's quit
//! eventcount, where user mode picks it up. Two continue signals coexist:
//! signal 22 is the job-control continue that wakes suspended processes and
//! clears pending stop signals, while signal 19 with the
//! [`SIGCONT_FROM_WAIT`] parameter is the wait-level rendezvous a parent
//! uses to release a stopped child it just collected.

use super::{ProcFlags, ProcIx, Proc2, Tables};
use crate::{
	fim::TRACE_STS_SIGNAL,
	status::{KResult, Status},
	uid::Uid,
};

/// Hangup.
pub const SIGHUP: u16 = 1;
/// Kill, unblockable.
pub const SIGKILL: u16 = 9;
/// Stop.
pub const SIGSTOP: u16 = 19;
/// Continue delivered from `wait`, recognized with [`SIGCONT_FROM_WAIT`].
pub const SIGCONT_WAIT: u16 = 19;
/// Job-control continue.
pub const SIGCONT: u16 = 22;

/// Parameter marking signal 19 as a continue-from-wait.
pub const SIGCONT_FROM_WAIT: i32 = 0x0012_0019;

/// A set of the 32 signals, one bit per signal, bit `n` for signal `n + 1`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SignalSet(pub u32);

impl SignalSet {
	/// The empty set.
	pub const EMPTY: Self = Self(0);
	/// Signals that skip the deliverability filter during FIM delivery.
	pub const BYPASS: Self = Self(0x3D9D_FFFF);
	/// Signals that require fault-style delivery; the rest are queued.
	pub const FAULT: Self = Self(0xFFFF_FF67);
	/// Complement of the stop signals: cleared on continue, unaffected by
	/// a vforked child's borrowed address space.
	pub const STOPPABLE: Self = Self(0xFE67_FFFF);
	/// Signals that never enter the pending path on their own.
	pub const NO_PENDING: Self = Self(0x3D9D_FFFF);

	/// The singleton set of `sig`.
	pub const fn of(sig: u16) -> Self {
		Self(1 << (sig.wrapping_sub(1) & 0x1F))
	}

	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}

	pub const fn contains(self, sig: u16) -> bool {
		self.0 & Self::of(sig).0 != 0
	}

	pub fn insert(&mut self, sig: u16) {
		self.0 |= Self::of(sig).0;
	}

	pub fn remove(&mut self, sig: u16) {
		self.0 &= !Self::of(sig).0;
	}

	/// Intersection.
	pub const fn and(self, other: Self) -> Self {
		Self(self.0 & other.0)
	}

	/// Set difference.
	pub const fn and_not(self, other: Self) -> Self {
		Self(self.0 & !other.0)
	}

	/// Union.
	pub const fn or(self, other: Self) -> Self {
		Self(self.0 | other.0)
	}

	/// Lowest-numbered signal of the set.
	pub fn lowest(self) -> Option<u16> {
		if self.0 == 0 {
			None
		} else {
			Some(self.0.trailing_zeros() as u16 + 1)
		}
	}

	/// Applies a clear/set pair.
	pub fn apply(&mut self, clear: u32, set: u32) {
		self.0 = (self.0 & !clear) | set;
	}
}

/// Per-process signal state.
#[derive(Clone, Copy, Debug, Default)]
pub struct SigState {
	/// Signals with a recorded user action.
	pub actions: SignalSet,
	/// Raised and not yet delivered.
	pub pending: SignalSet,
	/// Must not deliver now.
	pub blocked: SignalSet,
	/// Held back at the action level; a held signal is noted but not
	/// queued unless the process is being debugged.
	pub held: SignalSet,
	/// Signals routed through the alternate handler.
	pub alt_handler_bits: SignalSet,
	/// Signals handled on the signal stack.
	pub sigstack_bits: SignalSet,
	/// User fault handler entry point.
	pub handler_addr: u32,
	/// Alternate handler entry; doubles as the saved mask during sigpause.
	pub alt_mask: u32,
	/// Parameter of the pending continue (19).
	pub fault_param: i32,
	/// Signal recorded while the process sat in fault mode.
	pub fault_signal: i16,
	/// Set when a fault-mode signal is pending.
	pub fault_flag: bool,
	/// Signal that last stopped the process.
	pub stop_sig: u16,
	/// Status stashed for stop-signal reporting through FIM delivery.
	pub stored_status: u32,
}

/// In/out block of a FIM delivery exchange.
#[derive(Clone, Copy, Debug, Default)]
pub struct FimDelivery {
	pub signal: u16,
	pub status: u32,
	pub handler: u32,
	pub mask: u32,
	pub onstack: bool,
}

/// "Handled" bit in the status word of a FIM delivery exchange.
const DELIVERY_HANDLED: u32 = 0x0080_0000;

/// User-visible half of a signal context, as reloaded by sigreturn.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sigcontext {
	pub sc_onstack: i32,
	pub sc_mask: u32,
}

impl Proc2 {
	/// Picks the next signal to deliver to the entry, continue-from-wait
	/// first, otherwise the lowest unblocked pending signal. A vforked
	/// child on its parent's address space never takes stop signals.
	pub(crate) fn get_next_pending(t: &Tables, ix: ProcIx) -> u16 {
		let entry = t.entry(ix);
		if entry.sig.pending.contains(SIGCONT_WAIT)
			&& entry.sig.fault_param == SIGCONT_FROM_WAIT
		{
			return SIGCONT_WAIT;
		}
		let mut pending = entry.sig.pending.and_not(entry.sig.blocked);
		if entry.flags.contains(ProcFlags::ALT_ASID) {
			pending = pending.and(SignalSet::STOPPABLE);
		}
		pending.lowest().unwrap_or(0)
	}

	/// Raises `sig` on the entry and delivers it when possible.
	pub(crate) fn deliver_signal_locked(
		&self,
		t: &mut Tables,
		ix: ProcIx,
		sig: u16,
		param: i32,
	) -> KResult<()> {
		let bit = SignalSet::of(sig);
		let wakes = sig == SIGKILL
			|| sig == SIGCONT
			|| (sig == SIGCONT_WAIT && param == SIGCONT_FROM_WAIT);
		// A suspended process wakes for kill and both continues
		if t.entry(ix).flags.contains(ProcFlags::SUSPENDED) && wakes {
			t.entry_mut(ix).flags.remove(ProcFlags::SUSPENDED);
			let _ = self.proc1.resume(t.entry(ix).pid);
		}
		// Fault mode defers everything except the forcing signals
		if t.entry(ix).flags.contains(ProcFlags::FAULT_MODE) {
			if sig == SIGKILL || (sig == SIGCONT_WAIT && param == SIGCONT_FROM_WAIT) {
				let entry = t.entry_mut(ix);
				entry.sig.fault_signal = sig as i16;
				entry.sig.fault_flag = true;
				entry.sig.fault_param = param;
				entry.flags.remove(ProcFlags::FAULT_MODE);
				let _ = self.proc1.resume(entry.pid);
			}
			return Ok(());
		}
		if sig == SIGCONT {
			let entry = t.entry_mut(ix);
			entry.sig.pending = entry.sig.pending.and(SignalSet::STOPPABLE);
		}
		if t.entry(ix).sig.held.contains(sig) {
			if sig == SIGHUP {
				t.entry_mut(ix).flags.insert(ProcFlags::SIGHUP_PENDING);
			}
			if t.entry(ix).debugger.is_none() {
				return Ok(());
			}
		}
		if bit.and(SignalSet::STOPPABLE).is_empty() {
			// Delivering a stop signal cancels a pending continue
			t.entry_mut(ix).sig.pending.remove(SIGCONT);
			if t.entry(ix).flags.contains(ProcFlags::SUSPENDED) {
				return Ok(());
			}
		}
		let entry = t.entry(ix);
		let already = entry.sig.actions.contains(sig) || entry.sig.blocked.contains(sig);
		if !already && bit.and(SignalSet::NO_PENDING).is_empty() {
			return Ok(());
		}
		if sig == SIGCONT_WAIT {
			if t.entry(ix).sig.pending.contains(SIGCONT_WAIT) && param != SIGCONT_FROM_WAIT {
				return Err(Status::AnotherFaultPending);
			}
			t.entry_mut(ix).sig.fault_param = param;
		}
		t.entry_mut(ix).sig.pending.insert(sig);
		if !t.entry(ix).flags.contains(ProcFlags::SUSPENDED) {
			self.deliver_pending_locked(t, ix);
		}
		Ok(())
	}

	/// Delivers the next pending signal through the FIM, if the target's
	/// delivery gate allows it.
	pub(crate) fn deliver_pending_locked(&self, t: &mut Tables, ix: ProcIx) {
		let sig = Self::get_next_pending(t, ix);
		if sig == 0 {
			return;
		}
		let entry = t.entry(ix);
		let asid = entry.asid;
		if self.fim.quit_inhibit(asid) {
			let exempt = match sig {
				// The debugger may force a kill through the gate
				SIGKILL => entry.debugger == t.current_index(),
				SIGCONT_WAIT => entry.sig.fault_param == SIGCONT_FROM_WAIT,
				_ => false,
			};
			if !exempt {
				return;
			}
		}
		let status = if sig == SIGCONT_WAIT {
			t.entry(ix).sig.fault_param as u32
		} else {
			0
		};
		self.fim.set_trace_status(asid, status | TRACE_STS_SIGNAL);
		self.fim.set_quit_inhibit(asid, true);
		self.fim.deliver_trace_fault(asid);
		self.fim.quit_ec(asid).advance();
	}

	/// The FIM hand-off returning to user mode with a signal.
	///
	/// Returns `true` when a signal was delivered into `d`, `false` when
	/// none was pending and delivery advanced instead.
	pub fn deliver_fim(&self, d: &mut FimDelivery) -> bool {
		let mut t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			return false;
		}
		let asid = t.entry(ix).asid;
		let mut force_fault = false;
		let mut rounds = 0;
		while d.status & DELIVERY_HANDLED != 0 {
			let sig = Self::get_next_pending(&t, ix);
			d.signal = sig;
			if sig == 0 || rounds > 32 {
				self.fim.advance_signal_delivery(asid);
				return false;
			}
			rounds += 1;
			let bit = SignalSet::of(sig);
			if !bit.and(SignalSet::BYPASS).is_empty() || t.entry(ix).sig.actions.contains(sig)
			{
				d.status = if sig == SIGSTOP {
					t.entry(ix).sig.stored_status
				} else {
					0
				};
				d.status |= DELIVERY_HANDLED;
				force_fault = true;
				break;
			}
			t.entry_mut(ix).sig.blocked.remove(sig);
		}
		let mut sig = d.signal;
		if sig == 0 {
			self.fim.advance_signal_delivery(asid);
			return false;
		}
		let bit = SignalSet::of(sig);
		if !force_fault && bit.and(SignalSet::FAULT).is_empty() {
			// Queued, not fault-delivered
			let entry = t.entry_mut(ix);
			if entry.sig.pending.contains(sig) {
				entry.sig.blocked.insert(sig);
				self.fim.advance_signal_delivery(asid);
				return false;
			}
			if entry.sig.alt_handler_bits.contains(sig) {
				self.fim.advance_signal_delivery(asid);
				return false;
			}
		}
		// The debugger may capture the fault first
		if t.entry(ix).ptrace != Default::default() {
			let (captured, status) = self.xpd.capture_fault(sig, d.status);
			d.signal = captured;
			d.status = status;
			if captured == 0 {
				return false;
			}
			sig = captured;
		}
		let entry = t.entry_mut(ix);
		entry.sig.blocked.insert(sig);
		d.onstack = entry.flags.contains(ProcFlags::ALT_MASK_ARMED);
		if entry.sig.held.contains(sig) && !entry.flags.contains(ProcFlags::ALT_MASK_ARMED) {
			d.handler = entry.sig.handler_addr;
		}
		if entry.flags.contains(ProcFlags::ALT_MASK_ARMED) {
			d.mask = entry.sig.alt_mask;
			entry.flags.remove(ProcFlags::ALT_MASK_ARMED);
		} else {
			d.mask = entry.sig.blocked.0;
		}
		true
	}

	/// Replaces the calling process's blocked mask, delivering anything the
	/// new mask releases. Returns the old mask and the armed-alternate
	/// flag.
	pub fn sigsetmask(&self, mask: u32) -> (u32, bool) {
		let mut t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			return (0, false);
		}
		let old = t.entry(ix).sig.blocked.0;
		t.entry_mut(ix).sig.blocked = SignalSet(mask);
		let entry = t.entry(ix);
		if !entry.sig.pending.and_not(entry.sig.blocked).is_empty() {
			self.deliver_pending_locked(&mut t, ix);
		}
		let armed = t.entry(ix).flags.contains(ProcFlags::ALT_MASK_ARMED);
		(old, armed)
	}

	/// Installs `mask` as the blocked set and sleeps until a signal not in
	/// it is raised, then delivers it. Returns the installed mask and the
	/// armed-alternate flag as they stood when the wait began.
	pub fn sigpause(&self, mask: u32) -> (u32, bool) {
		let (ix, asid, result) = {
			let mut t = self.lock();
			let ix = t.current_index();
			if ix.is_none() {
				return (0, false);
			}
			let entry = t.entry_mut(ix);
			entry.sig.alt_mask = entry.sig.blocked.0;
			entry.sig.blocked = SignalSet(mask);
			entry.flags.insert(ProcFlags::ALT_MASK_ARMED);
			let result = (
				entry.sig.blocked.0,
				entry.flags.contains(ProcFlags::ALT_MASK_ARMED),
			);
			(ix, entry.asid, result)
		};
		let ec = self.fim.quit_ec(asid);
		loop {
			// The trigger must predate the pending check or an advance
			// racing the check is lost
			let trigger = ec.read() + 1;
			{
				let t = self.lock();
				let entry = t.entry(ix);
				if !entry.sig.pending.and_not(entry.sig.blocked).is_empty() {
					break;
				}
			}
			ec.wait(trigger);
		}
		let mut t = self.lock();
		self.deliver_pending_locked(&mut t, ix);
		result
	}

	/// Returns from a signal handler: reloads the blocked mask and the
	/// on-stack flag from the user context, delivers anything released,
	/// and unwinds the FIM delivery state. Returns the restored mask and
	/// the armed-alternate flag for the return trampoline.
	pub fn sigreturn(&self, ctx: &Sigcontext) -> (u32, bool) {
		let (asid, result) = {
			let mut t = self.lock();
			let ix = t.current_index();
			if ix.is_none() {
				return (0, false);
			}
			{
				let entry = t.entry_mut(ix);
				entry
					.flags
					.set(ProcFlags::ONSTACK, ctx.sc_onstack != 0);
				entry.sig.blocked = SignalSet(ctx.sc_mask);
			}
			let entry = t.entry(ix);
			let asid = entry.asid;
			if !entry.sig.pending.and_not(entry.sig.blocked).is_empty() {
				self.deliver_pending_locked(&mut t, ix);
			}
			let entry = t.entry(ix);
			(
				asid,
				(
					entry.sig.blocked.0,
					entry.flags.contains(ProcFlags::ALT_MASK_ARMED),
				),
			)
		};
		self.fim.fault_return(asid);
		result
	}

	/// Applies a clear/set mask pair across the signal state, with the
	/// priority and zombie housekeeping riding along. Returns the blocked
	/// mask and the armed-alternate flag.
	pub fn set_sig_mask(
		&self,
		priority_delta: i16,
		clear: &[u32; 8],
		set: &[u32; 8],
	) -> (u32, bool) {
		let mut t = self.lock();
		let ix = t.current_index();
		if ix.is_none() {
			return (0, false);
		}
		{
			let entry = t.entry_mut(ix);
			entry.sig.alt_handler_bits.apply(clear[0], set[0]);
			entry.sig.blocked.apply(clear[1], set[1]);
			entry.sig.actions.apply(clear[2], set[2]);
			entry.sig.sigstack_bits.apply(clear[3], set[3]);
			entry.sig.pending.0 &= !clear[4];
			entry.sig.held.apply(clear[5], set[5]);
			let clear_bytes = clear[6].to_le_bytes();
			let set_bytes = set[6].to_le_bytes();
			if clear_bytes[0] & 0x80 != 0 {
				entry.flags.remove(ProcFlags::ONSTACK);
			}
			if set_bytes[0] & 0x80 != 0 {
				entry.flags.insert(ProcFlags::ONSTACK);
			}
			if clear[6] != 0 {
				entry.sig.handler_addr = set[6];
			}
			if clear_bytes[1] & 0x80 != 0 {
				entry.flags.remove(ProcFlags::ALT_MASK_ARMED);
			}
			if set_bytes[1] & 0x80 != 0 {
				entry.flags.insert(ProcFlags::ALT_MASK_ARMED);
			}
		}
		if priority_delta != 0 {
			let old = t.entry(ix).priority;
			let new = old + priority_delta;
			if new < old && new > 0 {
				// Children above the new priority fall off the hierarchy
				let mut child = t.entry(ix).first_child;
				let mut prev = ProcIx::NONE;
				while !child.is_none() {
					let next = t.entry(child).next_sibling;
					if new < t.entry(child).priority {
						self.detach_from_parent(&mut t, child, prev);
					} else {
						prev = child;
					}
					child = next;
				}
			}
			t.entry_mut(ix).priority = new;
		}
		// Continue housekeeping: collect zombies stranded at our priority
		let entry = t.entry(ix);
		if !entry.sig.blocked.contains(18)
			&& (entry.sig.actions.contains(18) || entry.sig.alt_handler_bits.contains(18))
		{
			let my_priority = entry.priority;
			let alt18 = entry.sig.alt_handler_bits.contains(18);
			let mut child = entry.first_child;
			let mut prev = ProcIx::NONE;
			while !child.is_none() {
				let next = t.entry(child).next_sibling;
				let zombie = t.entry(child).lifecycle == super::Lifecycle::Zombie;
				if zombie && t.entry(child).priority == my_priority {
					if !alt18 {
						t.entry_mut(ix).flags.insert(ProcFlags::REAP_PENDING);
						break;
					}
					self.detach_from_parent(&mut t, child, prev);
				} else {
					prev = child;
				}
				child = next;
			}
		}
		let entry = t.entry(ix);
		if !entry.sig.pending.and_not(entry.sig.blocked).is_empty() {
			self.deliver_pending_locked(&mut t, ix);
		}
		let entry = t.entry(ix);
		(
			entry.sig.blocked.0,
			entry.flags.contains(ProcFlags::ALT_MASK_ARMED),
		)
	}

	/// Raises `sig` on every member of the pgroup at table index `pg`.
	pub(crate) fn signal_pgroup_locked(
		&self,
		t: &mut Tables,
		pg: u16,
		sig: u16,
		param: i32,
		check_perms: bool,
	) -> KResult<()> {
		let result = self.signal_pgroup_inner(t, pg, sig, param, check_perms);
		let status = match &result {
			Ok(()) => 0,
			Err(status) => status.code(),
		};
		self.log_signal_event(t, 2, pg, sig, param, status);
		result
	}

	fn signal_pgroup_inner(
		&self,
		t: &mut Tables,
		pg: u16,
		sig: u16,
		param: i32,
		check_perms: bool,
	) -> KResult<()> {
		if pg == 0 {
			return Err(Status::UidNotFound);
		}
		let cur = t.current_index();
		let cur_session = if cur.is_none() {
			0
		} else {
			t.entry(cur).session_id
		};
		let members: Vec<ProcIx> = t
			.iter_alloc()
			.filter(|&ix| t.entry(ix).pgroup_ix == pg)
			.collect();
		let mut signaled = false;
		let mut saw_zombie = false;
		let mut denied = false;
		for ix in members {
			if t.entry(ix).lifecycle == super::Lifecycle::Zombie {
				saw_zombie = true;
				continue;
			}
			if check_perms && !self.acl.check_fault_rights(t.entry(ix).pid) {
				// Continue within the session passes anyway
				let same_session = t.entry(ix).session_id == cur_session;
				if !(sig == SIGCONT && same_session) {
					denied = true;
					continue;
				}
			}
			let _ = self.deliver_signal_locked(t, ix, sig, param);
			signaled = true;
		}
		if signaled {
			if denied {
				Err(Status::PermissionDenied)
			} else {
				Ok(())
			}
		} else if saw_zombie {
			Err(Status::Zombie)
		} else {
			Err(Status::UidNotFound)
		}
	}

	/// Raises `sig` on every member of the pgroup named by `upgid`.
	pub fn signal_pgroup(
		&self,
		upgid: super::Upgid,
		sig: u16,
		param: i32,
		check_perms: bool,
	) -> KResult<()> {
		let mut t = self.lock();
		let pg = super::pgroup::find_by_upgid(&t, upgid);
		self.signal_pgroup_locked(&mut t, pg, sig, param, check_perms)
	}

	/// Raises `sig` on the process named by `uid`.
	pub fn signal_process(&self, uid: Uid, sig: u16, param: i32, check_perms: bool) -> KResult<()> {
		let mut t = self.lock();
		let (result, target) = match t.find_by_uid(uid) {
			Ok(ix) => {
				if check_perms && !self.acl.check_fault_rights(t.entry(ix).pid) {
					(Err(Status::PermissionDenied), ix)
				} else {
					(self.deliver_signal_locked(&mut t, ix, sig, param), ix)
				}
			}
			Err((status, ix)) => (Err(status), ix),
		};
		let status = match &result {
			Ok(()) => 0,
			Err(status) => status.code(),
		};
		if !target.is_none() {
			self.log_signal_event(&t, 1, target.0, sig, param, status);
		}
		result
	}

	/// Posts a signal-delivery record to the audit log.
	pub(crate) fn log_signal_event(
		&self,
		t: &Tables,
		event_type: u16,
		target: u16,
		sig: u16,
		param: i32,
		status: u32,
	) {
		let Some(audit) = self.audit() else {
			return;
		};
		if !audit.is_enabled() {
			return;
		}
		let (asid, upid, upgid) = if event_type == 2 {
			let upgid = t.pgroups[target as usize].upgid;
			(0, upgid, upgid)
		} else {
			let entry = t.entry(ProcIx(target));
			let upgid = if entry.pgroup_ix == 0 {
				1
			} else {
				t.pgroups[entry.pgroup_ix as usize].upgid
			};
			(entry.asid, entry.upid, upgid)
		};
		let mut data = Vec::with_capacity(12);
		data.extend_from_slice(&((event_type as u32) << 24 | 0xFDED).to_le_bytes());
		data.extend_from_slice(&asid.to_le_bytes());
		data.extend_from_slice(&sig.to_le_bytes());
		data.extend_from_slice(&param.to_le_bytes());
		data.extend_from_slice(&upid.to_le_bytes());
		let event_uid = Uid {
			high: 0x4165_836C,
			low: (event_type as u32) << 24 | 0xFDED,
		};
		let success = u16::from(status == 0);
		// The table lock is held here; the IDs ride along explicitly
		audit.log_event_ids(event_uid, success, status, &data, upid, upgid);
	}
}
