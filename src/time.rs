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

//! Time services.
//!
//! The kernel clock is a two-word value read with [`clock`]. The coarse tick
//! counter ([`clockh`]) advances once every four seconds and drives periodic
//! kernel work such as the audit flush server.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Length of one coarse clock tick.
pub const TICK: Duration = Duration::from_secs(4);

/// A two-word clock value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Clock {
	/// Seconds.
	pub high: u32,
	/// Sub-second remainder, in microseconds.
	pub low: u32,
}

/// Reads the current clock.
pub fn clock() -> Clock {
	let now = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO);
	Clock {
		high: now.as_secs() as u32,
		low: now.subsec_micros(),
	}
}

/// Reads the coarse tick counter.
pub fn clockh() -> u32 {
	clock().high / TICK.as_secs() as u32
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn clock_monotonic() {
		let a = clock();
		let b = clock();
		assert!(b.high >= a.high);
	}
}
