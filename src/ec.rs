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

//! Eventcounts.
//!
//! An eventcount is a monotonically increasing 64-bit counter, the kernel's
//! sole sleep primitive. A waiter declares a trigger value for each counter
//! it watches; the wait returns when any counter reaches its trigger.
//!
//! Every [`Eventcount::advance`] bumps a global generation and wakes all
//! waiters so they can re-check their triggers. This trades precision for a
//! total order: a waiter never misses an advance that happened after it
//! captured the generation.

use std::{
	sync::{Condvar, Mutex},
	time::{Duration, Instant},
};

/// Global wakeup board shared by all eventcounts.
static BOARD: Board = Board {
	generation: Mutex::new(0),
	cond: Condvar::new(),
};

struct Board {
	generation: Mutex<u64>,
	cond: Condvar,
}

impl Board {
	fn bump(&self) {
		let mut gen = self.generation.lock().unwrap();
		*gen += 1;
		self.cond.notify_all();
	}

	fn snapshot(&self) -> u64 {
		*self.generation.lock().unwrap()
	}

	/// Sleeps until the generation moves past `seen`, or `deadline` passes.
	///
	/// Returns `false` on timeout.
	fn sleep(&self, seen: u64, deadline: Option<Instant>) -> bool {
		let mut gen = self.generation.lock().unwrap();
		while *gen == seen {
			match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return false;
					}
					let (g, timeout) = self
						.cond
						.wait_timeout(gen, deadline - now)
						.unwrap();
					gen = g;
					if timeout.timed_out() && *gen == seen {
						return false;
					}
				}
				None => gen = self.cond.wait(gen).unwrap(),
			}
		}
		true
	}
}

/// A monotonically increasing event counter.
#[derive(Debug, Default)]
pub struct Eventcount {
	value: Mutex<i64>,
}

impl Eventcount {
	/// Creates a counter at zero.
	pub fn new() -> Self {
		Self::default()
	}

	/// Resets the counter to `value`.
	pub fn init(&self, value: i64) {
		*self.value.lock().unwrap() = value;
	}

	/// Reads the current value.
	pub fn read(&self) -> i64 {
		*self.value.lock().unwrap()
	}

	/// Advances the counter by one and wakes every waiter.
	pub fn advance(&self) {
		{
			let mut value = self.value.lock().unwrap();
			*value += 1;
		}
		BOARD.bump();
	}

	/// Waits until the counter reaches `trigger`.
	pub fn wait(&self, trigger: i64) {
		waitn(&[(self, trigger)]);
	}
}

/// Waits until any of the given counters reaches its trigger value.
///
/// Returns the 1-based index of the counter that fired; when several have
/// fired, the lowest index wins.
pub fn waitn(waits: &[(&Eventcount, i64)]) -> usize {
	loop {
		let seen = BOARD.snapshot();
		if let Some(n) = check(waits) {
			return n;
		}
		BOARD.sleep(seen, None);
	}
}

/// Like [`waitn`], with a relative deadline. Returns `None` when the deadline
/// passed before any counter fired.
pub fn waitn_deadline(waits: &[(&Eventcount, i64)], timeout: Duration) -> Option<usize> {
	let deadline = Instant::now() + timeout;
	loop {
		let seen = BOARD.snapshot();
		if let Some(n) = check(waits) {
			return Some(n);
		}
		if !BOARD.sleep(seen, Some(deadline)) {
			// Deadline passed; one last check to avoid racing an advance
			return check(waits);
		}
	}
}

fn check(waits: &[(&Eventcount, i64)]) -> Option<usize> {
	waits
		.iter()
		.position(|(ec, trigger)| ec.read() >= *trigger)
		.map(|i| i + 1)
}

#[cfg(test)]
mod test {
	use super::*;
	use std::{sync::Arc, thread};

	#[test]
	fn advance_wakes_waiter() {
		let ec = Arc::new(Eventcount::new());
		let ec2 = ec.clone();
		let handle = thread::spawn(move || {
			let trigger = ec2.read() + 1;
			ec2.wait(trigger);
			ec2.read()
		});
		thread::sleep(Duration::from_millis(20));
		ec.advance();
		assert!(handle.join().unwrap() >= 1);
	}

	#[test]
	fn waitn_reports_fired_index() {
		let a = Eventcount::new();
		let b = Eventcount::new();
		b.advance();
		let n = waitn(&[(&a, a.read() + 1), (&b, b.read())]);
		assert_eq!(n, 2);
	}

	#[test]
	fn deadline_elapses() {
		let a = Eventcount::new();
		let fired = waitn_deadline(&[(&a, 1)], Duration::from_millis(30));
		assert_eq!(fired, None);
	}

	#[test]
	fn negative_init() {
		let ec = Eventcount::new();
		ec.init(-1);
		ec.advance();
		assert_eq!(ec.read(), 0);
	}
}
