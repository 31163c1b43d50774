use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Instant;

use bytes::Bytes;

use crate::reactor::{ConnectSite, Protocol, SocketHandle};

/// Lifecycle of a socket slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Outbound connect in flight.
    Connecting,
    Open,
}

/// Per-socket state shared between the loop thread and reactor callers.
pub struct Slot {
    pub fd: Option<OwnedFd>,
    pub state: SlotState,
    /// Generation counter to detect stale handles.
    pub generation: u32,
    /// Callback table. Taken out while a callback runs.
    pub protocol: Option<Box<dyn Protocol>>,
    /// Pending connect result callback.
    pub connect_site: Option<Box<dyn ConnectSite>>,
    /// An attach has been requested and `on_attach` is not yet delivered.
    pub attach_pending: bool,
    pub outbound: VecDeque<Bytes>,
    pub pending_bytes: usize,
    /// A flush command is queued.
    pub flush_scheduled: bool,
    /// Write-ready callback installed.
    pub write_armed: bool,
    /// `on_ready` is owed once the outbound queue empties.
    pub drain_owed: bool,
    pub poll_in: bool,
    pub poll_out: bool,
    /// A forced data event is queued.
    pub forced: bool,
    /// Close once the outbound queue is flushed.
    pub close_requested: bool,
    pub timeout: u8,
    pub last_active: Instant,
}

impl Slot {
    fn new() -> Self {
        Slot {
            fd: None,
            state: SlotState::Free,
            generation: 0,
            protocol: None,
            connect_site: None,
            attach_pending: false,
            outbound: VecDeque::new(),
            pending_bytes: 0,
            flush_scheduled: false,
            write_armed: false,
            drain_owed: false,
            poll_in: false,
            poll_out: false,
            forced: false,
            close_requested: false,
            timeout: 0,
            last_active: Instant::now(),
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn reset(&mut self) {
        self.fd = None;
        self.state = SlotState::Free;
        self.protocol = None;
        self.connect_site = None;
        self.attach_pending = false;
        self.outbound.clear();
        self.pending_bytes = 0;
        self.flush_scheduled = false;
        self.write_armed = false;
        self.drain_owed = false;
        self.poll_in = false;
        self.poll_out = false;
        self.forced = false;
        self.close_requested = false;
        self.timeout = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Socket slots with a free list for O(1) allocation.
pub struct SocketTable {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

impl SocketTable {
    pub fn new(max_connections: u32) -> Self {
        let slots = (0..max_connections).map(|_| Slot::new()).collect();
        // Free list: indices in reverse order so pop gives lowest first.
        let free_list: Vec<u32> = (0..max_connections).rev().collect();
        SocketTable { slots, free_list }
    }

    /// Place `fd` in a free slot. Hands the descriptor back when full.
    pub fn allocate(
        &mut self,
        fd: OwnedFd,
        state: SlotState,
        timeout: u8,
    ) -> Result<SocketHandle, OwnedFd> {
        let Some(idx) = self.free_list.pop() else {
            return Err(fd);
        };
        let slot = &mut self.slots[idx as usize];
        slot.fd = Some(fd);
        slot.state = state;
        slot.timeout = timeout;
        slot.last_active = Instant::now();
        Ok(SocketHandle::new(idx, slot.generation))
    }

    /// Release a slot back to the free list. Returns what it still owned so
    /// the caller can drop or notify outside the table lock.
    pub fn release(&mut self, handle: SocketHandle) -> Option<Released> {
        let slot = self.get_mut(handle)?;
        let released = Released {
            attached: !slot.attach_pending,
            fd: slot.fd.take(),
            protocol: slot.protocol.take(),
            connect_site: slot.connect_site.take(),
        };
        slot.reset();
        self.free_list.push(handle.index);
        Some(released)
    }

    /// Slot for a live handle; `None` when free or stale.
    pub fn get(&self, handle: SocketHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index())
            .filter(|s| s.state != SlotState::Free && s.generation == handle.generation)
    }

    pub fn get_mut(&mut self, handle: SocketHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index())
            .filter(|s| s.state != SlotState::Free && s.generation == handle.generation)
    }

    /// Handles of every live slot.
    pub fn handles(&self) -> Vec<SocketHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state != SlotState::Free)
            .map(|(i, s)| SocketHandle::new(i as u32, s.generation))
            .collect()
    }

    /// Number of live slots.
    pub fn active_count(&self) -> usize {
        self.slots.len().saturating_sub(self.free_list.len())
    }
}

/// Resources detached from a released slot.
pub struct Released {
    /// `on_attach` was delivered (or no protocol was ever attached).
    pub attached: bool,
    pub fd: Option<OwnedFd>,
    pub protocol: Option<Box<dyn Protocol>>,
    pub connect_site: Option<Box<dyn ConnectSite>>,
}
