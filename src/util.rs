// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use num_traits::PrimInt;

/// Scratch buffer for zero-fill writes, eg. ZERO operation extents.
pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// Wrapper that debug-formats an integer as a byte count.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = if self.0 == T::one() { "byte" } else { "bytes" };

        write!(f, "<{:?} {unit}>", self.0)
    }
}
