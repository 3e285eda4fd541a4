//! Typed views of the records the kernel writes into a leader's ring buffer.
//!
//! Only the record types the collector acts on are given shape; everything
//! else is surfaced as [`Record::Other`] so the caller can count and skip it.

use std::io::Cursor;

use byteorder::{NativeEndian, ReadBytesExt};
use thiserror::Error;

use crate::sys::*;
use crate::SAMPLE_ID_ALL;

/// Section label for the addresses following a callchain sentinel. Until the
/// first sentinel shows up the section is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallchainSection {
    Unknown,
    User,
    Kernel,
    Hypervisor,
    Guest,
    GuestKernel,
    GuestUser,
}

impl CallchainSection {
    /// `Some` if the ip is one of the kernel's sentinel values rather than a
    /// real address.
    pub fn from_ip(ip: u64) -> Option<CallchainSection> {
        match ip {
            PERF_CONTEXT_HV => Some(CallchainSection::Hypervisor),
            PERF_CONTEXT_KERNEL => Some(CallchainSection::Kernel),
            PERF_CONTEXT_USER => Some(CallchainSection::User),
            PERF_CONTEXT_GUEST => Some(CallchainSection::Guest),
            PERF_CONTEXT_GUEST_KERNEL => Some(CallchainSection::GuestKernel),
            PERF_CONTEXT_GUEST_USER => Some(CallchainSection::GuestUser),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallchainSection::Unknown => "UNKNOWN",
            CallchainSection::User => "USER",
            CallchainSection::Kernel => "KERNEL",
            CallchainSection::Hypervisor => "HYPERVISOR",
            CallchainSection::Guest => "GUEST",
            CallchainSection::GuestKernel => "GUEST_KERNEL",
            CallchainSection::GuestUser => "GUEST_USER",
        }
    }
}

/// The trailing block every non-sample record carries when `sample_id_all`
/// is on, in the order implied by our sample set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleIdBlock {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub sample_id: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    /// Real instruction pointers interleaved with section sentinels.
    pub ips: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleRecord {
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
    pub sample_id: Option<SampleIdBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostRecord {
    pub id: u64,
    pub lost: u64,
    pub sample_id: Option<SampleIdBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Sample(SampleRecord),
    Throttle(ThrottleRecord),
    Unthrottle(ThrottleRecord),
    Lost(LostRecord),
    Other { kind: u32 },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("record payload truncated (kind {kind}, {len} bytes)")]
    Truncated { kind: u32, len: usize },
}

fn truncated(kind: u32, data: &[u8]) -> ParseError {
    ParseError::Truncated {
        kind,
        len: data.len(),
    }
}

fn read_sample_id(cur: &mut Cursor<&[u8]>) -> std::io::Result<SampleIdBlock> {
    Ok(SampleIdBlock {
        pid: cur.read_u32::<NativeEndian>()?,
        tid: cur.read_u32::<NativeEndian>()?,
        time: cur.read_u64::<NativeEndian>()?,
        stream_id: cur.read_u64::<NativeEndian>()?,
        id: cur.read_u64::<NativeEndian>()?,
    })
}

/// Parse a record payload (header already stripped) into its typed form.
pub fn parse_record(kind: u32, data: &[u8]) -> Result<Record, ParseError> {
    let mut cur = Cursor::new(data);
    match kind {
        PERF_RECORD_SAMPLE => {
            let parse = |cur: &mut Cursor<&[u8]>| -> std::io::Result<SampleRecord> {
                let sample_id = if SAMPLE_ID_ALL {
                    cur.read_u64::<NativeEndian>()?
                } else {
                    0
                };
                let pid = cur.read_u32::<NativeEndian>()?;
                let tid = cur.read_u32::<NativeEndian>()?;
                let time = cur.read_u64::<NativeEndian>()?;
                let stream_id = if SAMPLE_ID_ALL {
                    cur.read_u64::<NativeEndian>()?
                } else {
                    0
                };
                let nr = cur.read_u64::<NativeEndian>()?;
                let remaining = data.len() as u64 - cur.position();
                if nr > remaining / 8 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                let mut ips = Vec::with_capacity(nr as usize);
                for _ in 0..nr {
                    ips.push(cur.read_u64::<NativeEndian>()?);
                }
                Ok(SampleRecord {
                    sample_id,
                    pid,
                    tid,
                    time,
                    stream_id,
                    ips,
                })
            };
            parse(&mut cur)
                .map(Record::Sample)
                .map_err(|_| truncated(kind, data))
        }
        PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
            let parse = |cur: &mut Cursor<&[u8]>| -> std::io::Result<ThrottleRecord> {
                let time = cur.read_u64::<NativeEndian>()?;
                let id = cur.read_u64::<NativeEndian>()?;
                let stream_id = cur.read_u64::<NativeEndian>()?;
                let sample_id = if SAMPLE_ID_ALL {
                    Some(read_sample_id(cur)?)
                } else {
                    None
                };
                Ok(ThrottleRecord {
                    time,
                    id,
                    stream_id,
                    sample_id,
                })
            };
            let record = parse(&mut cur).map_err(|_| truncated(kind, data))?;
            if kind == PERF_RECORD_THROTTLE {
                Ok(Record::Throttle(record))
            } else {
                Ok(Record::Unthrottle(record))
            }
        }
        PERF_RECORD_LOST => {
            let parse = |cur: &mut Cursor<&[u8]>| -> std::io::Result<LostRecord> {
                let id = cur.read_u64::<NativeEndian>()?;
                let lost = cur.read_u64::<NativeEndian>()?;
                let sample_id = if SAMPLE_ID_ALL {
                    Some(read_sample_id(cur)?)
                } else {
                    None
                };
                Ok(LostRecord {
                    id,
                    lost,
                    sample_id,
                })
            };
            parse(&mut cur)
                .map(Record::Lost)
                .map_err(|_| truncated(kind, data))
        }
        other => Ok(Record::Other { kind: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn sample_id_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, 100);
        push_u32(&mut buf, 101);
        push_u64(&mut buf, 7_000);
        push_u64(&mut buf, 55);
        push_u64(&mut buf, 44);
        buf
    }

    #[test]
    fn parses_a_sample_with_sentinels() {
        let mut buf = Vec::new();
        push_u64(&mut buf, 44); // identifier
        push_u32(&mut buf, 1234); // pid
        push_u32(&mut buf, 1235); // tid
        push_u64(&mut buf, 9_999_999); // time
        push_u64(&mut buf, 55); // stream id
        push_u64(&mut buf, 3); // nr
        push_u64(&mut buf, PERF_CONTEXT_USER);
        push_u64(&mut buf, 0x40_1000);
        push_u64(&mut buf, 0x40_2000);

        let record = parse_record(PERF_RECORD_SAMPLE, &buf).unwrap();
        let Record::Sample(sample) = record else {
            panic!("expected a sample");
        };
        assert_eq!(sample.pid, 1234);
        assert_eq!(sample.tid, 1235);
        assert_eq!(sample.time, 9_999_999);
        assert_eq!(sample.ips.len(), 3);
        assert_eq!(
            CallchainSection::from_ip(sample.ips[0]),
            Some(CallchainSection::User)
        );
        assert_eq!(CallchainSection::from_ip(sample.ips[1]), None);
    }

    #[test]
    fn sample_with_lying_ip_count_is_truncated() {
        let mut buf = Vec::new();
        push_u64(&mut buf, 44);
        push_u32(&mut buf, 1);
        push_u32(&mut buf, 1);
        push_u64(&mut buf, 1);
        push_u64(&mut buf, 1);
        push_u64(&mut buf, 1000); // claims 1000 ips, carries none
        assert!(parse_record(PERF_RECORD_SAMPLE, &buf).is_err());
    }

    #[test]
    fn parses_throttle_and_unthrottle() {
        let mut buf = Vec::new();
        push_u64(&mut buf, 123_456);
        push_u64(&mut buf, 9);
        push_u64(&mut buf, 55);
        buf.extend_from_slice(&sample_id_bytes());

        let Record::Throttle(throttle) = parse_record(PERF_RECORD_THROTTLE, &buf).unwrap() else {
            panic!("expected a throttle");
        };
        assert_eq!(throttle.time, 123_456);
        assert_eq!(throttle.id, 9);
        assert_eq!(throttle.sample_id.unwrap().tid, 101);

        assert!(matches!(
            parse_record(PERF_RECORD_UNTHROTTLE, &buf).unwrap(),
            Record::Unthrottle(_)
        ));
    }

    #[test]
    fn parses_lost() {
        let mut buf = Vec::new();
        push_u64(&mut buf, 9);
        push_u64(&mut buf, 321);
        buf.extend_from_slice(&sample_id_bytes());

        let Record::Lost(lost) = parse_record(PERF_RECORD_LOST, &buf).unwrap() else {
            panic!("expected a lost record");
        };
        assert_eq!(lost.lost, 321);
    }

    #[test]
    fn unrecognized_kinds_pass_through() {
        assert_eq!(
            parse_record(77, &[]).unwrap(),
            Record::Other { kind: 77 }
        );
    }

    #[test]
    fn section_strings() {
        assert_eq!(CallchainSection::Unknown.as_str(), "UNKNOWN");
        assert_eq!(CallchainSection::Kernel.as_str(), "KERNEL");
        assert_eq!(
            CallchainSection::from_ip(PERF_CONTEXT_GUEST_KERNEL).unwrap(),
            CallchainSection::GuestKernel
        );
    }
}
