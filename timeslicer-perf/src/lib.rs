//! Shared perf_event plumbing for the timeslicer collector and its preload
//! shim: the raw kernel ABI, symbolic event encoding, counter-group
//! lifecycle, ring-buffer consumption, and the fd hand-off protocol the two
//! processes speak over a unix socket.

pub mod control;
pub mod counter;
pub mod events;
pub mod record;
pub mod ring;
pub mod sys;

/// Whether the sample-id-all block is requested on the leader and expected
/// on every non-sample record. Changing this changes the wire layout of
/// parsed records, so it is fixed at build time.
pub const SAMPLE_ID_ALL: bool = true;
