//! Transport seam.
//!
//! Concrete byte transports (serial port, JLink/RTT) live outside this
//! crate; everything the client needs from them is the small capability
//! set below. The loopback device in `nxscope-harness` implements the same
//! trait for tests.

use std::borrow::Cow;

use crate::error::Result;

/// A byte-oriented transport to an NxScope device.
///
/// Implementations are shared between the receive worker (reads) and the
/// command path (writes), so all methods take `&self`; interior mutability
/// is the implementation's concern.
pub trait Transport: Send + Sync {
    /// Bring the transport up. Called once at connect time.
    fn start(&self) -> Result<()>;

    /// Tear the transport down. Called at disconnect.
    fn stop(&self);

    /// Discard any buffered unread data.
    fn drop_all(&self);

    /// Read whatever bytes are available.
    ///
    /// An empty vector means no data right now. Implementations may block
    /// for a bounded time but never indefinitely.
    fn read(&self) -> Vec<u8>;

    /// Write raw bytes to the device.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Current write-side alignment in bytes (0 = none).
    fn write_padding(&self) -> u8;

    /// Reconfigure the write-side alignment.
    ///
    /// Learned from the device's cmninfo reply; devices using RX DMA only
    /// latch their receive trigger on full alignment blocks.
    fn set_write_padding(&self, padding: u8);

    /// Write `data` padded with trailing NUL bytes to a multiple of the
    /// configured write padding.
    fn write_aligned(&self, data: &[u8]) -> Result<()> {
        self.write(&align(data, self.write_padding()))
    }
}

/// Pad `data` with trailing NUL bytes to a multiple of `padding`.
#[must_use]
pub fn align(data: &[u8], padding: u8) -> Cow<'_, [u8]> {
    if padding == 0 {
        return Cow::Borrowed(data);
    }
    let rem = data.len() % padding as usize;
    if rem == 0 {
        return Cow::Borrowed(data);
    }
    let mut padded = data.to_vec();
    padded.resize(data.len() + padding as usize - rem, 0);
    Cow::Owned(padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_padding_passes_through() {
        assert_eq!(align(&[1, 2, 3], 0).as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn exact_multiple_is_unchanged() {
        assert_eq!(align(&[1, 2, 3, 4], 4).as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn short_writes_are_padded_with_nul() {
        assert_eq!(align(&[1, 2, 3], 4).as_ref(), &[1, 2, 3, 0]);
        assert_eq!(align(&[1], 16).len(), 16);
    }

    #[test]
    fn empty_write_stays_empty() {
        assert!(align(&[], 16).is_empty());
    }
}
