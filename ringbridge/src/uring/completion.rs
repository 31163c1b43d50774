/// Operation tags encoded in the upper 8 bits of user_data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpTag {
    /// One-shot POLLIN on a socket.
    Readable = 0,
    /// One-shot POLLOUT on a socket (write readiness, flush).
    Writable = 1,
    /// POLLOUT on a connecting socket.
    Connect = 2,
    /// Linked timeout guarding a connect poll.
    ConnectTimeout = 3,
    /// Accept on a listener. The index is the listener slot.
    Accept = 4,
    EventFdRead = 5,
    /// Periodic housekeeping tick.
    Tick = 6,
    /// Async cancel (informational CQE only).
    Cancel = 7,
}

impl OpTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OpTag::Readable),
            1 => Some(OpTag::Writable),
            2 => Some(OpTag::Connect),
            3 => Some(OpTag::ConnectTimeout),
            4 => Some(OpTag::Accept),
            5 => Some(OpTag::EventFdRead),
            6 => Some(OpTag::Tick),
            7 => Some(OpTag::Cancel),
            _ => None,
        }
    }
}

/// Encoded user_data for io_uring CQE identification.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..56: OpTag (8 bits)
/// Bits 55..32: slot index (24 bits)
/// Bits 31..0:  slot generation
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub u64);

impl UserData {
    const TAG_SHIFT: u64 = 56;
    const INDEX_SHIFT: u64 = 32;
    const TAG_MASK: u64 = 0xFF << Self::TAG_SHIFT;
    const INDEX_MASK: u64 = 0x00FF_FFFF << Self::INDEX_SHIFT;
    const GEN_MASK: u64 = 0xFFFF_FFFF;

    #[inline]
    pub fn encode(tag: OpTag, index: u32, generation: u32) -> Self {
        debug_assert!(index < (1 << 24), "index exceeds 24 bits");
        let v = ((tag as u64) << Self::TAG_SHIFT)
            | (((index as u64) & 0x00FF_FFFF) << Self::INDEX_SHIFT)
            | (generation as u64);
        UserData(v)
    }

    #[inline]
    pub fn tag(self) -> Option<OpTag> {
        let raw = ((self.0 & Self::TAG_MASK) >> Self::TAG_SHIFT) as u8;
        OpTag::from_u8(raw)
    }

    #[inline]
    pub fn index(self) -> u32 {
        ((self.0 & Self::INDEX_MASK) >> Self::INDEX_SHIFT) as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 & Self::GEN_MASK) as u32
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}
