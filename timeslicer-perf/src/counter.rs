//! A counter group: one sample-enabled software clock leader plus any number
//! of count-only event counters opened against the same task. Enabling and
//! disabling act on the leader, so the children observe consistent windows.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use log::debug;
use thiserror::Error;

use crate::events::{encode, EncodeError};
use crate::ring::RingBuffer;
use crate::sys::*;
use crate::SAMPLE_ID_ALL;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error(transparent)]
    BadEvent(#[from] EncodeError),

    #[error("perf_event_open failed for {what}: {source}")]
    Open {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("could not map the leader's ring buffer: {0}")]
    Map(#[source] io::Error),

    #[error("expected {expected} fds for the group, received {received}")]
    FdCount { expected: usize, received: usize },
}

/// Counter values accumulated since the previous reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCounts {
    pub leader_ticks: u64,
    pub event_counts: Vec<(String, u64)>,
}

#[derive(Debug)]
pub struct CounterGroup {
    tid: u32,
    leader: OwnedFd,
    events: Vec<(String, OwnedFd)>,
    ring: Option<RingBuffer>,
}

fn sample_type() -> u64 {
    let base = PERF_SAMPLE_TIME | PERF_SAMPLE_CALLCHAIN | PERF_SAMPLE_TID;
    if SAMPLE_ID_ALL {
        base | PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_STREAM_ID
    } else {
        base
    }
}

fn read_count(fd: BorrowedFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    let n = unsafe {
        libc::read(
            fd.as_raw_fd(),
            &mut value as *mut u64 as *mut libc::c_void,
            mem::size_of::<u64>(),
        )
    };
    if n != mem::size_of::<u64>() as isize {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn ioctl_plain(fd: BorrowedFd, request: libc::c_ulong) -> io::Result<()> {
    let ok = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, 0) };
    if ok == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl CounterGroup {
    /// Open a disabled group for `tid`: the software cpu-clock leader samples
    /// `{TIME, CALLCHAIN, TID}` (plus identifier/stream when sample_id_all is
    /// on) every `period` nanoseconds and wakes its consumer per event; each
    /// named event becomes a count-only child.
    pub fn open(tid: u32, period: u64, event_names: &[String]) -> Result<CounterGroup, GroupError> {
        debug!("opening counter group for task {tid}, period {period}");
        let mut attr = PerfEventAttr::zeroed();
        attr.kind = PERF_TYPE_SOFTWARE;
        attr.config = PERF_COUNT_SW_CPU_CLOCK;
        attr.sample_type = sample_type();
        attr.sample_period_or_freq = period;
        attr.wakeup_events_or_watermark = 1;
        attr.flags = PERF_ATTR_FLAG_DISABLED;
        if SAMPLE_ID_ALL {
            attr.flags |= PERF_ATTR_FLAG_SAMPLE_ID_ALL;
        }

        let fd = sys_perf_event_open(&attr, tid as libc::pid_t, -1, -1, PERF_FLAG_FD_CLOEXEC);
        if fd < 0 {
            return Err(GroupError::Open {
                what: format!("cpu-clock leader (task {tid})"),
                source: io::Error::last_os_error(),
            });
        }
        let leader = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut events = Vec::with_capacity(event_names.len());
        for name in event_names {
            let mut attr = encode(name)?;
            // count-only child in the leader's group, live as soon as the
            // leader is enabled
            attr.sample_period_or_freq = 0;
            let fd = sys_perf_event_open(&attr, tid as libc::pid_t, -1, leader.as_raw_fd(), 0);
            if fd < 0 {
                return Err(GroupError::Open {
                    what: format!("event `{name}` (task {tid})"),
                    source: io::Error::last_os_error(),
                });
            }
            events.push((name.clone(), unsafe { OwnedFd::from_raw_fd(fd) }));
        }

        Ok(CounterGroup {
            tid,
            leader,
            events,
            ring: None,
        })
    }

    /// Rebuild a group from fds that arrived over the control socket: the
    /// leader first, then the event fds in configured order.
    pub fn from_received_fds(
        tid: u32,
        fds: Vec<OwnedFd>,
        event_names: &[String],
    ) -> Result<CounterGroup, GroupError> {
        if fds.len() != 1 + event_names.len() {
            return Err(GroupError::FdCount {
                expected: 1 + event_names.len(),
                received: fds.len(),
            });
        }
        let mut fds = fds.into_iter();
        let leader = fds.next().unwrap();
        let events = event_names.iter().cloned().zip(fds).collect();
        Ok(CounterGroup {
            tid,
            leader,
            events,
            ring: None,
        })
    }

    /// Map the leader's ring buffer into this process. Done on the consumer
    /// side only; the opening side never reads records.
    pub fn map_ring(&mut self) -> Result<(), GroupError> {
        let ring = RingBuffer::map(self.leader.as_fd()).map_err(GroupError::Map)?;
        self.ring = Some(ring);
        Ok(())
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn leader_fd(&self) -> RawFd {
        self.leader.as_raw_fd()
    }

    pub fn ring_mut(&mut self) -> Option<&mut RingBuffer> {
        self.ring.as_mut()
    }

    /// All fds of the group, leader first, in the order the control protocol
    /// expects.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        let mut fds = Vec::with_capacity(1 + self.events.len());
        fds.push(self.leader.as_raw_fd());
        fds.extend(self.events.iter().map(|(_, fd)| fd.as_raw_fd()));
        fds
    }

    /// Start the whole group by enabling the leader.
    pub fn enable(&self) -> io::Result<()> {
        ioctl_plain(self.leader.as_fd(), PERF_EVENT_IOC_ENABLE)
    }

    pub fn disable(&self) -> io::Result<()> {
        ioctl_plain(self.leader.as_fd(), PERF_EVENT_IOC_DISABLE)
    }

    /// Update the leader's sample period in-kernel.
    pub fn set_period(&self, period: u64) -> io::Result<()> {
        let ok = unsafe {
            libc::ioctl(
                self.leader.as_raw_fd(),
                PERF_EVENT_IOC_PERIOD as _,
                &period as *const u64,
            )
        };
        if ok == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Close this process's descriptors without disabling the shared event
    /// object. Used after the fds have been duplicated into the collector,
    /// which owns the group's teardown from then on.
    pub fn release(self) {
        let mut this = std::mem::ManuallyDrop::new(self);
        unsafe {
            std::ptr::drop_in_place(&mut this.ring);
            std::ptr::drop_in_place(&mut this.events);
            std::ptr::drop_in_place(&mut this.leader);
        }
    }

    /// Read every counter's accumulated value and reset it, leader first.
    /// The counts are attributable to the window since the previous reset.
    pub fn read_and_reset(&self) -> io::Result<GroupCounts> {
        let leader_ticks = read_count(self.leader.as_fd())?;
        ioctl_plain(self.leader.as_fd(), PERF_EVENT_IOC_RESET)?;

        let mut event_counts = Vec::with_capacity(self.events.len());
        for (name, fd) in &self.events {
            let count = read_count(fd.as_fd())?;
            ioctl_plain(fd.as_fd(), PERF_EVENT_IOC_RESET)?;
            event_counts.push((name.clone(), count));
        }
        Ok(GroupCounts {
            leader_ticks,
            event_counts,
        })
    }
}

impl Drop for CounterGroup {
    fn drop(&mut self) {
        // The fds close on drop and the ring unmaps on drop; stopping the
        // leader first keeps the kernel from writing into a buffer that is
        // about to disappear.
        let _ = self.disable();
        debug!("tore down counter group for task {}", self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fd() -> OwnedFd {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::close(fds[1]) };
        unsafe { OwnedFd::from_raw_fd(fds[0]) }
    }

    #[test]
    fn received_fds_map_onto_event_names_in_order() {
        let names = vec!["cpu-cycles".to_string(), "instructions".to_string()];
        let fds = vec![pipe_fd(), pipe_fd(), pipe_fd()];
        let expected: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();

        let group = CounterGroup::from_received_fds(42, fds, &names).unwrap();
        assert_eq!(group.tid(), 42);
        assert_eq!(group.leader_fd(), expected[0]);
        assert_eq!(group.raw_fds(), expected);
        assert_eq!(group.events[0].0, "cpu-cycles");
        assert_eq!(group.events[1].0, "instructions");
        // Drop closes them; the ioctl on a pipe fails and is ignored.
    }

    #[test]
    fn fd_count_mismatch_is_rejected() {
        let names = vec!["cpu-cycles".to_string()];
        let err = CounterGroup::from_received_fds(1, vec![pipe_fd()], &names).unwrap_err();
        match err {
            GroupError::FdCount { expected, received } => {
                assert_eq!(expected, 2);
                assert_eq!(received, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sample_type_carries_the_identifier_block() {
        let st = sample_type();
        assert_ne!(st & PERF_SAMPLE_TIME, 0);
        assert_ne!(st & PERF_SAMPLE_CALLCHAIN, 0);
        assert_ne!(st & PERF_SAMPLE_TID, 0);
        assert_ne!(st & PERF_SAMPLE_IDENTIFIER, 0);
        assert_ne!(st & PERF_SAMPLE_STREAM_ID, 0);
    }

    #[test]
    fn read_count_reads_eight_bytes() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let value: u64 = 0xdead_beef_cafe;
        let n = unsafe {
            libc::write(
                fds[1],
                &value as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);
        unsafe { libc::close(fds[1]) };
        assert_eq!(read_count(read_end.as_fd()).unwrap(), value);
    }
}
