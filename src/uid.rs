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

//! Object identifiers.
//!
//! Every kernel object (process, file, audit event, ACL) is named by a 64-bit
//! UID made of two 32-bit words. UIDs are generated from the creation time
//! and a monotonic counter so they never repeat on a node.

use crate::time;
use std::sync::atomic::{AtomicU32, Ordering};

/// Generation counter, advanced once per generated UID.
static UID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// A 64-bit object identifier.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Uid {
	/// High word.
	pub high: u32,
	/// Low word.
	pub low: u32,
}

impl Uid {
	/// The distinguished empty UID.
	pub const NIL: Self = Self {
		high: 0,
		low: 0,
	};

	/// Generates a fresh UID.
	pub fn generate() -> Self {
		let count = UID_COUNTER.fetch_add(1, Ordering::Relaxed);
		Self {
			high: time::clock().high,
			low: count,
		}
	}

	/// Tells whether the UID is [`Self::NIL`].
	pub fn is_nil(self) -> bool {
		self == Self::NIL
	}

	/// Hashes the UID into a bucket in `0..modulo`.
	pub fn bucket(self, modulo: u16) -> u16 {
		(((self.high ^ self.low) % modulo as u32) & 0xFFFF) as u16
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn generate_unique() {
		let a = Uid::generate();
		let b = Uid::generate();
		assert_ne!(a, b);
		assert!(!a.is_nil());
	}

	#[test]
	fn bucket_range() {
		for _ in 0..100 {
			assert!(Uid::generate().bucket(37) < 37);
		}
	}
}
