use std::io;
use std::os::fd::RawFd;

use io_uring::types::{Fd, Timespec};
use io_uring::{IoUring, opcode, squeue};

use super::completion::{OpTag, UserData};
use crate::config::Config;

/// Wrapper around IoUring providing the SQE helpers the reactor needs.
pub struct Ring {
    pub(crate) ring: IoUring,
}

impl Ring {
    /// Create and configure the io_uring instance.
    pub fn setup(config: &Config) -> io::Result<Self> {
        let cq_entries = config
            .sq_entries
            .checked_mul(4)
            .unwrap_or(config.sq_entries);

        let mut builder = IoUring::builder();
        builder.setup_cqsize(cq_entries);
        let ring = builder.build(config.sq_entries)?;
        Ok(Ring { ring })
    }

    /// Arm a one-shot poll on `fd`.
    pub fn submit_poll(&mut self, fd: RawFd, mask: u32, user_data: UserData) -> io::Result<()> {
        let entry = opcode::PollAdd::new(Fd(fd), mask)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Arm a POLLOUT on a connecting socket, linked to a timeout. The
    /// timespec must remain valid until both CQEs arrive.
    pub fn submit_connect_poll(
        &mut self,
        fd: RawFd,
        index: u32,
        generation: u32,
        timeout: Option<*const Timespec>,
    ) -> io::Result<()> {
        let poll_ud = UserData::encode(OpTag::Connect, index, generation);
        let mask = (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) as u32;
        let poll = opcode::PollAdd::new(Fd(fd), mask)
            .build()
            .user_data(poll_ud.raw());

        let Some(ts) = timeout else {
            return unsafe { self.push_sqe(poll) };
        };
        let timeout_ud = UserData::encode(OpTag::ConnectTimeout, index, generation);
        let timeout = opcode::LinkTimeout::new(ts)
            .build()
            .user_data(timeout_ud.raw());
        unsafe { self.push_sqe_chain(&mut [poll, timeout]) }
    }

    /// Submit an accept on a non-blocking listener. Peer address is not
    /// collected.
    pub fn submit_accept(&mut self, listen_fd: RawFd, index: u32, generation: u32) -> io::Result<()> {
        let user_data = UserData::encode(OpTag::Accept, index, generation);
        let entry = opcode::Accept::new(Fd(listen_fd), std::ptr::null_mut(), std::ptr::null_mut())
            .flags(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit an eventfd read (8 bytes).
    pub fn submit_eventfd_read(&mut self, eventfd: RawFd, buf: *mut u8) -> io::Result<()> {
        let user_data = UserData::encode(OpTag::EventFdRead, 0, 0);
        let entry = opcode::Read::new(Fd(eventfd), buf, 8)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit a timeout SQE that fires after the given duration.
    /// Produces a CQE with -ETIME when it fires.
    pub fn submit_tick_timeout(&mut self, ts: *const Timespec) -> io::Result<()> {
        let user_data = UserData::encode(OpTag::Tick, 0, 0);
        let entry = opcode::Timeout::new(ts)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit an async cancel targeting a specific user_data value.
    pub fn submit_async_cancel(&mut self, target: UserData) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Cancel, target.index(), 0);
        let entry = opcode::AsyncCancel::new(target.raw())
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit all pending SQEs and wait for at least `min_complete` CQEs.
    pub fn submit_and_wait(&self, min_complete: u32) -> io::Result<()> {
        match self.ring.submitter().submit_and_wait(min_complete as usize) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Submit pending SQEs without waiting.
    pub fn flush(&self) -> io::Result<()> {
        self.ring.submit()?;
        Ok(())
    }

    /// Push an SQE to the submission queue, submitting first if it is full.
    ///
    /// # Safety
    /// The SQE must reference valid memory for the lifetime of the operation.
    pub(crate) unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }

    /// Push a chain of linked SQEs atomically.
    ///
    /// Sets `IOSQE_IO_LINK` on all entries except the last.
    ///
    /// # Safety
    /// All SQEs must reference valid memory for the lifetime of their operations.
    pub(crate) unsafe fn push_sqe_chain(&mut self, entries: &mut [squeue::Entry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let last = entries.len() - 1;
        for entry in entries[..last].iter_mut() {
            *entry = entry.clone().flags(squeue::Flags::IO_LINK);
        }

        {
            let sq = self.ring.submission();
            if sq.capacity() - sq.len() < entries.len() {
                drop(sq);
                self.ring.submit()?;
                let sq = self.ring.submission();
                if sq.capacity() - sq.len() < entries.len() {
                    return Err(io::Error::other("SQ too small for chain"));
                }
            }
        }

        unsafe {
            self.ring
                .submission()
                .push_multiple(entries)
                .map_err(|_| io::Error::other("SQ full after flush for chain"))?;
        }
        Ok(())
    }
}
