// Copyright 2026 Spindle Authors.
// This file is part of Spindle.

// Spindle is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Spindle is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Spindle.  If not, see <http://www.gnu.org/licenses/>.

use blake2b_rs::Blake2bBuilder;

/// Computes the 32-byte blake2b digest of `data`.
pub fn blake2b_256<T: AsRef<[u8]>>(data: T) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut context = Blake2bBuilder::new(32).build();
    context.update(data.as_ref());
    context.finalize(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_len_and_determinism() {
        let a = blake2b_256(b"spindle");
        let b = blake2b_256(b"spindle");
        assert_eq!(a, b);
        assert_ne!(a, blake2b_256(b"spindle!"));
    }

    #[test]
    fn test_empty_input() {
        let empty = blake2b_256(&[] as &[u8]);
        assert_ne!(empty, [0u8; 32]);
    }
}
