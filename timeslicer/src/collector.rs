//! The sampling engine: launches the subject, receives counter groups over
//! the control socket, multiplexes ring-buffer readiness through a
//! level-triggered epoll, adapts the sample period to kernel throttling,
//! and emits one annotated timeslice per wake.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Instant;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::Pid;

use timeslicer_perf::control::{recv_message, ControlEvent, ControlMessage, CMD_REGISTER, CMD_UNREGISTER};
use timeslicer_perf::counter::CounterGroup;
use timeslicer_perf::events::Preset;
use timeslicer_perf::record::{
    parse_record, CallchainSection, LostRecord, Record, SampleRecord, ThrottleRecord,
};

use crate::background::BackgroundReading;
use crate::config::{
    SampleConfig, EPOLL_TIME_DIFF_MAX_MS, MAX_RECORD_READS, MAX_SAMPLE_PERIOD_SKIPS, MIN_PERIOD,
    PERIOD_ADJUST_SCALE,
};
use crate::error::{internal, CollectorError};
use crate::kernel_symbols::KernelSymbols;
use crate::output::{PerfErrorRecord, ResultWriter, StackFrame, Timeslice};
use crate::proc_maps;
use crate::process::SuspendedSubject;
use crate::rapl;
use crate::registry::FdRegistry;
use crate::symbolize::demangle::demangle_any;
use crate::symbolize::{BuildError, MemoryMap};
use crate::wattsup::WattsUp;

pub struct RunSummary {
    pub timeslices: u64,
}

/// Non-sample notifications pulled out of a ring during one wake; they are
/// acted on after the drain so the ring borrow stays local.
enum RingNotice {
    Throttle(ThrottleRecord),
    Unthrottle(ThrottleRecord),
    Lost(LostRecord),
}

/// Profile `command` to completion (or external termination) and write the
/// result stream. On a fatal error the stream is still finalized so the
/// output stays parseable.
pub fn record(
    config: &SampleConfig,
    command: &OsStr,
    args: &[OsString],
) -> Result<RunSummary, CollectorError> {
    let file = File::create(&config.result_file).map_err(|source| CollectorError::ResultFile {
        path: config.result_file.clone(),
        source,
    })?;
    let mut writer = ResultWriter::new(BufWriter::new(file));
    writer
        .header(config.presets.iter().map(|p| p.name().to_string()))
        .map_err(internal)?;

    // Rendezvous and termination signals are consumed synchronously, never
    // through handlers.
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGTERM);
    blocked.add(Signal::SIGUSR2);
    blocked.add(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), None).map_err(internal)?;

    let mut term_set = SigSet::empty();
    term_set.add(Signal::SIGTERM);
    let sigterm = SignalFd::with_flags(&term_set, SfdFlags::SFD_NONBLOCK).map_err(internal)?;

    let (collector_sock, subject_sock) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_NONBLOCK,
    )
    .map_err(internal)?;
    set_cloexec(collector_sock.as_raw_fd());

    let extra_env: Vec<(OsString, OsString)> = vec![
        ("LD_PRELOAD".into(), config.preload.clone().into()),
        (
            "COLLECTOR_CONTROL_FD".into(),
            subject_sock.as_raw_fd().to_string().into(),
        ),
        (
            "COLLECTOR_PID".into(),
            nix::unistd::getpid().to_string().into(),
        ),
        ("COLLECTOR_PERIOD".into(), config.period.to_string().into()),
        ("COLLECTOR_EVENTS".into(), config.events.join(",").into()),
    ];

    let suspended = SuspendedSubject::launch(command, args, &extra_env).map_err(internal)?;
    let subject_pid = suspended.pid();
    info!("subject launched suspended with pid {subject_pid}");

    let subject = suspended.resume().map_err(internal)?;
    drop(subject_sock);

    // The shim's constructor signals us once the subject image is loaded;
    // SIGCHLD instead means the subject died before its first instruction.
    let mut rendezvous = SigSet::empty();
    rendezvous.add(Signal::SIGUSR2);
    rendezvous.add(Signal::SIGCHLD);
    match rendezvous.wait().map_err(internal)? {
        Signal::SIGUSR2 => {}
        _ => {
            subject.try_reap();
            let _ = writer.flush();
            return Err(internal("subject exited before sampling began"));
        }
    }

    // Verify we can read the subject's image at all before symbolizing.
    let exe_path = format!("/proc/{subject_pid}/exe");
    if let Err(source) = File::open(&exe_path) {
        let _ = kill(Pid::from_raw(subject_pid as i32), Signal::SIGKILL);
        let _ = writer.flush();
        return Err(CollectorError::ExecutableFile {
            path: exe_path.into(),
            source,
        });
    }

    let regions = proc_maps::read_process_maps(subject_pid).map_err(internal)?;
    let memory_map = match MemoryMap::build(&regions, &config.source_scope) {
        Ok(map) => map,
        Err(BuildError::NoDebugInfo) => {
            let _ = kill(Pid::from_raw(subject_pid as i32), Signal::SIGKILL);
            let _ = writer.flush();
            return Err(CollectorError::DebugSymbols);
        }
    };

    let kernel_syms = KernelSymbols::from_proc();
    if kernel_syms.is_empty() {
        warn!("kernel symbols unavailable; kernel frames will be unresolved");
    }

    let mut collector = Collector {
        config,
        epoll: Epoll::new(EpollCreateFlags::empty()).map_err(internal)?,
        sigterm,
        control: collector_sock,
        registry: FdRegistry::default(),
        period: config.period,
        writer,
        errors: Vec::new(),
        rapl: None,
        wattsup: None,
        memory_map,
        kernel_syms,
        timeslices: 0,
        skips: 0,
        done: false,
    };

    collector.add_to_epoll(collector.sigterm.as_raw_fd()).map_err(internal)?;
    collector.add_to_epoll(collector.control.as_raw_fd()).map_err(internal)?;

    // The subject's main task is monitored directly; only tasks created
    // later arrive over the control socket.
    let mut main_group =
        CounterGroup::open(subject_pid, config.period, &config.events)?;
    main_group.map_ring()?;
    main_group.enable().map_err(internal)?;
    collector.watch_group(main_group)?;

    collector.start_background_readers();

    // Release the shim; the subject's main starts now.
    kill(Pid::from_raw(subject_pid as i32), Signal::SIGUSR2).map_err(internal)?;
    if config.notify_start {
        let _ = kill(nix::unistd::getppid(), Signal::SIGUSR2);
    }
    info!("sampling started for pid {subject_pid}");

    let run_result = collector.run();
    let summary = collector.finalize();
    subject.try_reap();

    match run_result {
        Ok(()) => summary,
        Err(err) => {
            let _ = kill(Pid::from_raw(subject_pid as i32), Signal::SIGTERM);
            Err(err)
        }
    }
}

/// The period controller's transfer function. `None` means the period is
/// left untouched (further unthrottling would cross the floor).
fn next_period(period: u64, throttled: bool) -> Option<u64> {
    if throttled {
        Some(period.saturating_mul(PERIOD_ADJUST_SCALE))
    } else if period / PERIOD_ADJUST_SCALE >= MIN_PERIOD {
        Some(period / PERIOD_ADJUST_SCALE)
    } else {
        None
    }
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags != -1 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

struct Collector<'a, W: Write> {
    config: &'a SampleConfig,
    epoll: Epoll,
    sigterm: SignalFd,
    control: OwnedFd,
    registry: FdRegistry,
    period: u64,
    writer: ResultWriter<W>,
    errors: Vec<PerfErrorRecord>,
    rapl: Option<BackgroundReading<BTreeMap<String, u64>>>,
    wattsup: Option<BackgroundReading<f64>>,
    memory_map: MemoryMap,
    kernel_syms: KernelSymbols,
    timeslices: u64,
    skips: u32,
    done: bool,
}

impl<W: Write> Collector<'_, W> {
    fn add_to_epoll(&self, fd: RawFd) -> nix::Result<()> {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
    }

    fn delete_from_epoll(&self, fd: RawFd) -> nix::Result<()> {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed)
    }

    /// Insert a live group into the registry and arm the multiplexer for
    /// its leader.
    fn watch_group(&mut self, group: CounterGroup) -> Result<(), CollectorError> {
        self.add_to_epoll(group.leader_fd())
            .map_err(|e| internal(format!("could not arm leader fd: {e}")))?;
        debug!(
            "watching task {} through leader fd {}",
            group.tid(),
            group.leader_fd()
        );
        self.registry.insert(group);
        Ok(())
    }

    fn start_background_readers(&mut self) {
        if self.config.preset_enabled(Preset::Rapl) {
            let reading = BackgroundReading::spawn(|| Some(rapl::read_energy()));
            reading.restart();
            self.rapl = Some(reading);
        }
        if self.config.preset_enabled(Preset::Wattsup) {
            match WattsUp::open(&self.config.wattsup_device) {
                Ok(mut meter) => {
                    let reading = BackgroundReading::spawn(move || meter.read_watts().ok());
                    reading.restart();
                    self.wattsup = Some(reading);
                }
                Err(err) => warn!("wattsup meter unavailable, continuing without it: {err}"),
            }
        }
    }

    fn run(&mut self) -> Result<(), CollectorError> {
        let mut events = vec![EpollEvent::empty(); 64];
        let mut last_wake = Instant::now();
        while !self.done {
            let ready = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(internal(format!("epoll wait failed: {err}"))),
            };

            let gap = last_wake.elapsed();
            if gap.as_millis() > EPOLL_TIME_DIFF_MAX_MS {
                debug!("significant time between wakes: {gap:?}");
            }

            if !self.check_priority_fds(&events[..ready])? {
                for event in &events[..ready] {
                    self.drain_leader(event.data() as RawFd)?;
                }
            }
            last_wake = Instant::now();
        }
        Ok(())
    }

    /// Termination and control traffic preempt sample draining; when either
    /// fires, leaders wait for the next wake (they stay ready, the
    /// multiplexer is level-triggered).
    fn check_priority_fds(&mut self, ready: &[EpollEvent]) -> Result<bool, CollectorError> {
        for event in ready {
            let fd = event.data() as RawFd;
            if fd == self.sigterm.as_raw_fd() {
                debug!("termination signal received");
                while let Ok(Some(_)) = self.sigterm.read_signal() {}
                self.done = true;
                return Ok(true);
            }
            if fd == self.control.as_raw_fd() {
                self.drain_control()?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn drain_control(&mut self) -> Result<(), CollectorError> {
        loop {
            match recv_message(self.control.as_fd()).map_err(internal)? {
                ControlEvent::WouldBlock => return Ok(()),
                ControlEvent::Closed => {
                    debug!("control socket closed; no further registrations");
                    self.delete_from_epoll(self.control.as_raw_fd())
                        .map_err(internal)?;
                    return Ok(());
                }
                ControlEvent::Message(msg) => self.handle_control_message(msg)?,
            }
        }
    }

    fn handle_control_message(&mut self, msg: ControlMessage) -> Result<(), CollectorError> {
        match msg.cmd {
            CMD_REGISTER => {
                debug!("register request from task {}", msg.tid);
                let mut group =
                    CounterGroup::from_received_fds(msg.tid, msg.fds, &self.config.events)?;
                group.map_ring()?;
                self.watch_group(group)
            }
            CMD_UNREGISTER => {
                debug!("unregister request from task {}", msg.tid);
                match self.registry.find_by_tid(msg.tid) {
                    Some(fd) => {
                        self.delete_from_epoll(fd).map_err(internal)?;
                        drop(self.registry.remove(fd));
                        Ok(())
                    }
                    None => {
                        debug!("no group registered for task {}", msg.tid);
                        Ok(())
                    }
                }
            }
            other => Err(internal(format!("unknown control command {other}"))),
        }
    }

    /// Pull up to `MAX_RECORD_READS` records from one leader's ring, then
    /// clear whatever is left so slow symbolization cannot let the buffer
    /// back up. One timeslice is emitted per wake, from the first clean
    /// sample.
    fn drain_leader(&mut self, fd: RawFd) -> Result<(), CollectorError> {
        let mut pending_sample: Option<SampleRecord> = None;
        let mut notices: Vec<RingNotice> = Vec::new();

        {
            let Some(group) = self.registry.get_mut(fd) else {
                return Err(internal(format!("ready fd {fd} has no registered group")));
            };
            let Some(ring) = group.ring_mut() else {
                return Err(internal(format!("group on fd {fd} has no mapped ring")));
            };

            if !ring.has_records() {
                self.skips += 1;
                debug!("empty wake ({} in a row)", self.skips);
                if self.skips >= MAX_SAMPLE_PERIOD_SKIPS {
                    return Err(internal(
                        "too many consecutive empty wakes; ring consumer desynchronized",
                    ));
                }
                return Ok(());
            }
            self.skips = 0;

            for _ in 0..MAX_RECORD_READS {
                let Some(raw) = ring.next_record() else { break };
                let starts_at_end = raw.starts_at_buffer_end;
                let payload = raw.data.to_cow();
                match parse_record(raw.kind, &payload) {
                    Ok(Record::Sample(sample)) => {
                        if pending_sample.is_some() {
                            continue;
                        }
                        if starts_at_end {
                            // Known race: the kernel can rewrite a record
                            // sitting exactly on the region edge. Better one
                            // missing slice than a corrupt one.
                            debug!("sample on the mapped region edge, skipping");
                            continue;
                        }
                        pending_sample = Some(sample);
                    }
                    Ok(Record::Throttle(t)) => notices.push(RingNotice::Throttle(t)),
                    Ok(Record::Unthrottle(t)) => notices.push(RingNotice::Unthrottle(t)),
                    Ok(Record::Lost(l)) => notices.push(RingNotice::Lost(l)),
                    Ok(Record::Other { kind }) => debug!("unhandled record type {kind}"),
                    Err(err) => warn!("skipping unparseable record: {err}"),
                }
            }

            let dropped = ring.drain();
            if dropped > 0 {
                debug!("cleared {dropped} bytes of unread records on fd {fd}");
            }
        }

        for notice in notices {
            match notice {
                RingNotice::Throttle(t) => {
                    self.adjust_period(true)?;
                    self.errors.push(PerfErrorRecord::throttle(&t));
                }
                RingNotice::Unthrottle(t) => {
                    self.adjust_period(false)?;
                    self.errors.push(PerfErrorRecord::unthrottle(&t));
                }
                RingNotice::Lost(l) => {
                    warn!("kernel reported {} lost records", l.lost);
                    self.errors.push(PerfErrorRecord::lost(&l));
                }
            }
        }

        if let Some(sample) = pending_sample {
            self.emit_timeslice(fd, &sample)?;
        }
        Ok(())
    }

    /// Scale the period up on throttle, down on unthrottle (bounded below
    /// by `MIN_PERIOD`), and apply the new value to every live counter.
    fn adjust_period(&mut self, throttled: bool) -> Result<(), CollectorError> {
        match next_period(self.period, throttled) {
            Some(period) => self.period = period,
            None => {
                debug!(
                    "unthrottle ignored, period {} is already at the floor",
                    self.period
                );
                return Ok(());
            }
        }
        debug!("sample period is now {}", self.period);
        for group in self.registry.groups() {
            group
                .set_period(self.period)
                .map_err(|e| internal(format!("failed to apply period: {e}")))?;
        }
        Ok(())
    }

    fn emit_timeslice(&mut self, fd: RawFd, sample: &SampleRecord) -> Result<(), CollectorError> {
        let counts = {
            let Some(group) = self.registry.get_mut(fd) else {
                return Err(internal(format!("sample from unregistered fd {fd}")));
            };
            group.read_and_reset().map_err(internal)?
        };

        let energy = self.rapl.as_ref().and_then(|reading| {
            if reading.has_result() {
                let value = reading.take();
                reading.restart();
                value
            } else {
                None
            }
        });
        let wattsup = self.wattsup.as_ref().and_then(|reading| {
            if reading.has_result() {
                let value = reading.take();
                reading.restart();
                value
            } else {
                None
            }
        });

        let slice = Timeslice {
            cpu_time_ns: sample.time,
            num_cpu_timer_ticks: counts.leader_ticks,
            pid: sample.pid,
            tid: sample.tid,
            events: counts.event_counts.into_iter().collect(),
            energy,
            wattsup,
            stack_frames: self.symbolize_ips(&sample.ips),
        };
        self.writer.timeslice(&slice).map_err(internal)?;
        self.timeslices += 1;
        Ok(())
    }

    /// Walk the captured callchain: sentinels re-label the section for the
    /// addresses that follow; everything else becomes a frame.
    fn symbolize_ips(&self, ips: &[u64]) -> Vec<StackFrame> {
        let mut section = CallchainSection::Unknown;
        let mut frames = Vec::with_capacity(ips.len());
        for &ip in ips {
            if let Some(marker) = CallchainSection::from_ip(ip) {
                section = marker;
                continue;
            }
            frames.push(self.frame_for(ip, section));
        }
        frames
    }

    fn frame_for(&self, ip: u64, section: CallchainSection) -> StackFrame {
        let mut frame = StackFrame {
            address: ip,
            section: section.as_str(),
            sym_name: None,
            file_name: None,
            file_base: None,
            sym_addr: None,
            mangled_name: None,
            line: None,
            col: None,
            full_location: None,
        };

        match section {
            CallchainSection::User => {
                if let Some(module) = self.memory_map.module_for(ip) {
                    frame.file_name = Some(module.path.clone());
                    frame.file_base = Some(module.mapping_base);
                    if let Some(hit) = module.lookup(ip) {
                        frame.mangled_name = Some(hit.name.to_string());
                        frame.sym_name = Some(demangle_any(hit.name));
                        frame.sym_addr = Some(hit.sym_addr);
                    }
                }
                if frame.sym_name.is_none() {
                    if let Some(sym) = self.memory_map.find_symbol(ip) {
                        frame.sym_name = Some(sym.name.clone());
                    }
                }
                // The captured address is a return address; the call site
                // is the instruction before it.
                if let Some(hit) = self.memory_map.find_line(ip.saturating_sub(1)) {
                    hit.line.add_sample();
                    frame.line = Some(hit.line.number());
                    frame.col = Some(hit.col);
                    frame.full_location = Some(hit.file_name.to_string());
                }
            }
            CallchainSection::Kernel => {
                if let Some((sym_addr, name)) = self.kernel_syms.lookup(ip) {
                    frame.sym_name = Some(name.to_string());
                    frame.mangled_name = Some(name.to_string());
                    frame.file_name = Some("(kernel)".to_string());
                    frame.sym_addr = Some(sym_addr);
                }
            }
            _ => {}
        }
        frame
    }

    /// Stop the background readers, append the errors tail, and flush.
    /// Called on every exit path so the stream is always parseable.
    fn finalize(&mut self) -> Result<RunSummary, CollectorError> {
        if let Some(mut reading) = self.rapl.take() {
            reading.stop();
        }
        if let Some(mut reading) = self.wattsup.take() {
            reading.stop();
        }
        self.writer.errors(&self.errors).map_err(internal)?;
        self.writer.flush().map_err(internal)?;
        info!(
            "wrote {} timeslices and {} error records",
            self.timeslices,
            self.errors.len()
        );
        Ok(RunSummary {
            timeslices: self.timeslices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::next_period;
    use crate::config::{MIN_PERIOD, PERIOD_ADJUST_SCALE};

    #[test]
    fn throttling_scales_the_period_up() {
        assert_eq!(
            next_period(MIN_PERIOD, true),
            Some(MIN_PERIOD * PERIOD_ADJUST_SCALE)
        );
        assert_eq!(next_period(10_000_000, true), Some(100_000_000));
    }

    #[test]
    fn unthrottling_scales_down_until_the_floor() {
        assert_eq!(
            next_period(MIN_PERIOD * PERIOD_ADJUST_SCALE, false),
            Some(MIN_PERIOD)
        );
        // dividing again would cross the floor; the period stays put
        assert_eq!(next_period(MIN_PERIOD, false), None);
        assert_eq!(next_period(MIN_PERIOD + 1, false), None);
    }

    #[test]
    fn throttle_then_unthrottle_round_trips() {
        let throttled = next_period(MIN_PERIOD, true).unwrap();
        assert_eq!(next_period(throttled, false), Some(MIN_PERIOD));
    }
}
