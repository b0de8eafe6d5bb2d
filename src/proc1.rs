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

//! Low-level task layer.
//!
//! PROC1 names every schedulable entity by a small PID and owns binding,
//! resumption and priorities. The high-level process manager builds its
//! process table on top of these tasks.
//!
//! Each bound task is backed by an OS thread. A freshly bound task stays
//! parked until the first [`Proc1::resume`]; the thread then installs its PID
//! as the calling context and runs the entry closure to completion.

use crate::{
	mst::Asid,
	status::{KResult, Status},
};
use std::{
	cell::Cell,
	collections::HashSet,
	sync::{Arc, Condvar, Mutex},
	thread,
};

/// A low-level task identifier.
pub type Pid = u16;

/// Maximum number of tasks.
pub const MAX_TASKS: usize = 128;

/// PID of the boot task, which becomes the init process.
pub const BOOT_PID: Pid = 1;

/// Entry closure of a bound task.
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
	static CURRENT: Cell<Pid> = const { Cell::new(BOOT_PID) };
	static AS_ID: Cell<Asid> = const { Cell::new(1) };
}

/// Returns the PID of the calling context.
pub fn current() -> Pid {
	CURRENT.with(Cell::get)
}

/// Returns the ASID of the calling context.
pub fn as_id() -> Asid {
	AS_ID.with(Cell::get)
}

/// Switches the calling context to another address space.
pub fn set_as_id(asid: Asid) {
	AS_ID.with(|c| c.set(asid));
}

/// Restores the previous calling context on drop.
pub struct CurrentGuard {
	prev_pid: Pid,
	prev_asid: Asid,
}

impl Drop for CurrentGuard {
	fn drop(&mut self) {
		CURRENT.with(|c| c.set(self.prev_pid));
		AS_ID.with(|c| c.set(self.prev_asid));
	}
}

/// Installs `(pid, asid)` as the calling context until the guard drops.
///
/// Threads not spawned by [`Proc1::bind`] (tests, callers driving a task by
/// hand) use this to act on a task's behalf.
pub fn enter(pid: Pid, asid: Asid) -> CurrentGuard {
	let guard = CurrentGuard {
		prev_pid: current(),
		prev_asid: as_id(),
	};
	CURRENT.with(|c| c.set(pid));
	AS_ID.with(|c| c.set(asid));
	guard
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TaskState {
	/// Bound, waiting for the first resume.
	Bound,
	/// Released to run.
	Running,
}

struct Gate {
	state: Mutex<TaskState>,
	cond: Condvar,
}

impl Gate {
	fn wait_released(&self) {
		let mut state = self.state.lock().unwrap();
		while *state != TaskState::Running {
			state = self.cond.wait(state).unwrap();
		}
	}

	fn release(&self) {
		*self.state.lock().unwrap() = TaskState::Running;
		self.cond.notify_all();
	}
}

struct Task {
	gate: Arc<Gate>,
	/// (min, max) scheduling priority.
	priority: (u16, u16),
	ty: u8,
	handle: Option<thread::JoinHandle<()>>,
}

struct Inner {
	tasks: Vec<Option<Task>>,
	stacks: HashSet<u32>,
	next_stack: u32,
}

/// The task layer.
pub struct Proc1 {
	inner: Mutex<Inner>,
}

const NO_PID: Status = Status::External(0x0001_0001);
const BAD_PID: Status = Status::External(0x0001_0002);

impl Proc1 {
	/// Creates the task layer with the boot task bound and running.
	pub fn new() -> Self {
		let mut tasks: Vec<Option<Task>> = (0..MAX_TASKS).map(|_| None).collect();
		let gate = Arc::new(Gate {
			state: Mutex::new(TaskState::Running),
			cond: Condvar::new(),
		});
		tasks[BOOT_PID as usize] = Some(Task {
			gate,
			priority: (0x10, 0x10),
			ty: 0,
			handle: None,
		});
		Self {
			inner: Mutex::new(Inner {
				tasks,
				stacks: HashSet::new(),
				next_stack: 1,
			}),
		}
	}

	/// Binds `entry` to a fresh task and returns its PID.
	///
	/// The task does not run until resumed.
	pub fn bind(&self, entry: TaskEntry, _stack: u32, _flags: u32) -> KResult<Pid> {
		let gate = Arc::new(Gate {
			state: Mutex::new(TaskState::Bound),
			cond: Condvar::new(),
		});
		let pid = {
			let mut inner = self.inner.lock().unwrap();
			let pid = (2..MAX_TASKS)
				.find(|&i| inner.tasks[i].is_none())
				.ok_or(NO_PID)? as Pid;
			inner.tasks[pid as usize] = Some(Task {
				gate: gate.clone(),
				priority: (0, 0),
				ty: 0,
				handle: None,
			});
			pid
		};
		let runner = move || {
			gate.wait_released();
			CURRENT.with(|c| c.set(pid));
			entry();
		};
		let handle = thread::Builder::new()
			.name(format!("task-{pid}"))
			.spawn(runner)
			.map_err(|_| NO_PID)?;
		let mut inner = self.inner.lock().unwrap();
		if let Some(task) = inner.tasks[pid as usize].as_mut() {
			task.handle = Some(handle);
		}
		Ok(pid)
	}

	/// Binds and immediately resumes a kernel server task.
	pub fn create_p(&self, entry: TaskEntry, _flags: u32) -> KResult<Pid> {
		let pid = self.bind(entry, 0, 0)?;
		self.resume(pid)?;
		Ok(pid)
	}

	/// Releases a bound or suspended task.
	pub fn resume(&self, pid: Pid) -> KResult<()> {
		let gate = {
			let inner = self.inner.lock().unwrap();
			let task = inner.tasks[pid as usize].as_ref().ok_or(BAD_PID)?;
			task.gate.clone()
		};
		gate.release();
		Ok(())
	}

	/// Releases the task's slot. The backing thread is detached; a task
	/// unbinding itself simply runs to the end of its entry closure.
	pub fn unbind(&self, pid: Pid) -> KResult<()> {
		let mut inner = self.inner.lock().unwrap();
		let task = inner.tasks[pid as usize].take().ok_or(BAD_PID)?;
		drop(task.handle);
		Ok(())
	}

	/// Allocates a task stack and returns its handle.
	pub fn alloc_stack(&self, _size: u32) -> KResult<u32> {
		let mut inner = self.inner.lock().unwrap();
		let id = inner.next_stack;
		inner.next_stack += 1;
		inner.stacks.insert(id);
		Ok(id)
	}

	/// Frees a stack previously returned by [`Self::alloc_stack`].
	pub fn free_stack(&self, id: u32) {
		self.inner.lock().unwrap().stacks.remove(&id);
	}

	/// Queries (`mode == 0`) or sets (high byte of `mode` non-zero) the
	/// task's priority bounds.
	pub fn set_priority(&self, pid: Pid, mode: u16, min: &mut u16, max: &mut u16) {
		let mut inner = self.inner.lock().unwrap();
		let Some(task) = inner.tasks[pid as usize].as_mut() else {
			return;
		};
		if mode & 0xFF00 != 0 {
			task.priority = (*min, *max);
		} else {
			(*min, *max) = task.priority;
		}
	}

	/// Sets the task's type.
	pub fn set_type(&self, pid: Pid, ty: u8) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(task) = inner.tasks[pid as usize].as_mut() {
			task.ty = ty;
		}
	}

	/// Tells whether the PID names a live task.
	pub fn is_bound(&self, pid: Pid) -> bool {
		self.inner.lock().unwrap().tasks[pid as usize].is_some()
	}
}

impl Default for Proc1 {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::{AtomicU16, Ordering};

	#[test]
	fn bind_runs_after_resume() {
		let p1 = Proc1::new();
		let seen = Arc::new(AtomicU16::new(0));
		let seen2 = seen.clone();
		let pid = p1
			.bind(
				Box::new(move || {
					seen2.store(current(), Ordering::SeqCst);
				}),
				0,
				0,
			)
			.unwrap();
		assert_eq!(seen.load(Ordering::SeqCst), 0);
		p1.resume(pid).unwrap();
		while seen.load(Ordering::SeqCst) == 0 {
			thread::yield_now();
		}
		assert_eq!(seen.load(Ordering::SeqCst), pid);
	}

	#[test]
	fn enter_restores_context() {
		let prev = current();
		{
			let _guard = enter(42, 7);
			assert_eq!(current(), 42);
			assert_eq!(as_id(), 7);
		}
		assert_eq!(current(), prev);
	}

	#[test]
	fn stack_roundtrip() {
		let p1 = Proc1::new();
		let a = p1.alloc_stack(0x1000).unwrap();
		let b = p1.alloc_stack(0x1000).unwrap();
		assert_ne!(a, b);
		p1.free_stack(a);
		p1.free_stack(b);
	}
}
