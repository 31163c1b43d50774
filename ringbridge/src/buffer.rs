use crate::reactor::{Reactor, SocketHandle};

/// Capacity of a single read cycle.
pub const MAX_READ: usize = 8192;

/// Fixed-capacity read buffer used for one data-in cycle.
///
/// Lives on the stack of the data handler and is never retained across
/// events, so it carries no cross-call state.
pub struct ReadBuffer {
    len: isize,
    data: [u8; MAX_READ],
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadBuffer {
    pub fn new() -> Self {
        ReadBuffer {
            len: 0,
            data: [0u8; MAX_READ],
        }
    }

    /// Read at most [`MAX_READ`] bytes from `handle`. Returns the raw result of
    /// the reactor read: 0 or negative means nothing to deliver.
    pub fn fill(&mut self, reactor: &dyn Reactor, handle: SocketHandle) -> isize {
        self.fill_with(|buf| reactor.read(handle, buf))
    }

    /// Fill from an arbitrary reader. Results above capacity are clamped.
    pub fn fill_with<F>(&mut self, read: F) -> isize
    where
        F: FnOnce(&mut [u8]) -> isize,
    {
        self.len = read(&mut self.data).min(MAX_READ as isize);
        self.len
    }

    /// Bytes read in the current cycle (0 after a failed read).
    pub fn len(&self) -> usize {
        self.len.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len <= 0
    }

    /// The read consumed the whole capacity; more data may be pending.
    pub fn is_full(&self) -> bool {
        self.len == MAX_READ as isize
    }

    /// View over the bytes read in the current cycle.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_read() {
        let mut buf = ReadBuffer::new();
        let n = buf.fill_with(|b| {
            b[..4].copy_from_slice(b"bye\n");
            4
        });
        assert_eq!(n, 4);
        assert_eq!(buf.as_bytes(), b"bye\n");
        assert!(!buf.is_full());
        assert!(!buf.is_empty());
    }

    #[test]
    fn full_read() {
        let mut buf = ReadBuffer::new();
        buf.fill_with(|b| {
            b.fill(b'x');
            b.len() as isize
        });
        assert_eq!(buf.len(), MAX_READ);
        assert!(buf.is_full());
    }

    #[test]
    fn failed_read_is_empty() {
        let mut buf = ReadBuffer::new();
        assert_eq!(buf.fill_with(|_| -1), -1);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        assert!(buf.as_bytes().is_empty());

        buf.fill_with(|_| 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn refill_resets_length() {
        let mut buf = ReadBuffer::new();
        buf.fill_with(|b| b.len() as isize);
        assert!(buf.is_full());
        buf.fill_with(|b| {
            b[0] = b'a';
            1
        });
        assert_eq!(buf.as_bytes(), b"a");
    }
}
