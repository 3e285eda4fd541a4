//! The result stream: one JSON record per line, each tagged with a `kind`
//! discriminator so downstream tooling can parse the file without knowing
//! record order. The header goes out before sampling starts and the error
//! records trail the timeslices.

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde_derive::Serialize;

use timeslicer_perf::record::{LostRecord, ThrottleRecord};

#[derive(Debug, Serialize)]
pub struct StackFrame {
    pub address: u64,
    pub section: &'static str,
    pub sym_name: Option<String>,
    pub file_name: Option<String>,
    pub file_base: Option<u64>,
    pub sym_addr: Option<u64>,
    pub mangled_name: Option<String>,
    pub line: Option<u32>,
    pub col: Option<u32>,
    pub full_location: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Timeslice {
    pub cpu_time_ns: u64,
    pub num_cpu_timer_ticks: u64,
    pub pid: u32,
    pub tid: u32,
    pub events: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wattsup: Option<f64>,
    pub stack_frames: Vec<StackFrame>,
}

/// Throttle/unthrottle/lost notifications collected during sampling; they
/// are observability data, not failures.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PerfErrorRecord {
    Throttle {
        time_ns: u64,
        id: u64,
        stream_id: u64,
    },
    Unthrottle {
        time_ns: u64,
        id: u64,
        stream_id: u64,
    },
    Lost {
        id: u64,
        count: u64,
    },
}

impl PerfErrorRecord {
    pub fn throttle(record: &ThrottleRecord) -> Self {
        PerfErrorRecord::Throttle {
            time_ns: record.time,
            id: record.id,
            stream_id: record.stream_id,
        }
    }

    pub fn unthrottle(record: &ThrottleRecord) -> Self {
        PerfErrorRecord::Unthrottle {
            time_ns: record.time,
            id: record.id,
            stream_id: record.stream_id,
        }
    }

    pub fn lost(record: &LostRecord) -> Self {
        PerfErrorRecord::Lost {
            id: record.id,
            count: record.lost,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ResultRecord<'a> {
    Header {
        program_version: &'a str,
        presets: Vec<String>,
    },
    Timeslice(&'a Timeslice),
    Error { error: &'a PerfErrorRecord },
}

pub struct ResultWriter<W: Write> {
    out: W,
}

impl<W: Write> ResultWriter<W> {
    pub fn new(out: W) -> Self {
        ResultWriter { out }
    }

    fn write(&mut self, record: &ResultRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")
    }

    pub fn header(&mut self, presets: impl Iterator<Item = String>) -> io::Result<()> {
        self.write(&ResultRecord::Header {
            program_version: env!("CARGO_PKG_VERSION"),
            presets: presets.collect(),
        })
    }

    pub fn timeslice(&mut self, slice: &Timeslice) -> io::Result<()> {
        self.write(&ResultRecord::Timeslice(slice))
    }

    pub fn errors(&mut self, errors: &[PerfErrorRecord]) -> io::Result<()> {
        for error in errors {
            self.write(&ResultRecord::Error { error })?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn lines(buf: &[u8]) -> Vec<Value> {
        std::str::from_utf8(buf)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn stream_is_line_delimited_and_kind_tagged() {
        let mut writer = ResultWriter::new(Vec::new());
        writer
            .header(["cpu".to_string(), "rapl".to_string()].into_iter())
            .unwrap();
        let slice = Timeslice {
            cpu_time_ns: 123,
            num_cpu_timer_ticks: 456,
            pid: 10,
            tid: 11,
            events: [("cpu-cycles".to_string(), 999u64)].into_iter().collect(),
            energy: None,
            wattsup: Some(92.5),
            stack_frames: vec![StackFrame {
                address: 0x40_1000,
                section: "USER",
                sym_name: Some("foo".into()),
                file_name: Some("/usr/bin/subject".into()),
                file_base: Some(0x40_0000),
                sym_addr: Some(0x40_0f00),
                mangled_name: Some("_Z3foov".into()),
                line: Some(42),
                col: Some(7),
                full_location: Some("/src/subject.cc".into()),
            }],
        };
        writer.timeslice(&slice).unwrap();
        writer
            .errors(&[
                PerfErrorRecord::Throttle {
                    time_ns: 5,
                    id: 1,
                    stream_id: 2,
                },
                PerfErrorRecord::Lost { id: 1, count: 17 },
            ])
            .unwrap();
        writer.flush().unwrap();

        let records = lines(&writer.out);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["kind"], "header");
        assert_eq!(records[0]["presets"][1], "rapl");
        assert_eq!(records[1]["kind"], "timeslice");
        assert_eq!(records[1]["events"]["cpu-cycles"], 999);
        assert_eq!(records[1]["stack_frames"][0]["sym_name"], "foo");
        assert_eq!(records[1]["stack_frames"][0]["line"], 42);
        // no energy key when the mailbox was empty
        assert!(records[1].get("energy").is_none());
        assert_eq!(records[2]["kind"], "error");
        assert_eq!(records[2]["error"]["type"], "throttle");
        assert_eq!(records[3]["error"]["count"], 17);
    }

    #[test]
    fn perf_error_records_carry_the_ring_payloads() {
        let throttle = ThrottleRecord {
            time: 9,
            id: 3,
            stream_id: 4,
            sample_id: None,
        };
        match PerfErrorRecord::throttle(&throttle) {
            PerfErrorRecord::Throttle {
                time_ns,
                id,
                stream_id,
            } => {
                assert_eq!((time_ns, id, stream_id), (9, 3, 4));
            }
            _ => panic!("wrong variant"),
        }
        let lost = LostRecord {
            id: 8,
            lost: 2,
            sample_id: None,
        };
        assert!(matches!(
            PerfErrorRecord::lost(&lost),
            PerfErrorRecord::Lost { id: 8, count: 2 }
        ));
    }
}
