//! The interposition shim, loaded into the subject via `LD_PRELOAD`. It
//! wraps `pthread_create`, `fork`, and the `execve` family: every new task
//! gets a counter group opened against it, and the group's fds are handed to
//! the collector over the inherited control socket. The shim performs the
//! startup rendezvous with the collector before the subject's `main` runs
//! and notifies the collector when the subject exits.
//!
//! The shim stays inert (pure pass-through) when the collector's environment
//! variables are absent, so a stray preload does not break the host process.

use std::ffi::c_void;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use timeslicer_perf::control::{send_register, send_unregister};
use timeslicer_perf::counter::CounterGroup;

static ENABLED: AtomicBool = AtomicBool::new(false);
static CONTROL_FD: AtomicI32 = AtomicI32::new(-1);
static COLLECTOR_PID: AtomicI32 = AtomicI32::new(0);
static INITIAL_PID: AtomicI32 = AtomicI32::new(0);
static PERIOD: AtomicU64 = AtomicU64::new(0);
static EVENTS: OnceLock<Vec<String>> = OnceLock::new();

static REAL_PTHREAD_CREATE: AtomicUsize = AtomicUsize::new(0);
static REAL_FORK: AtomicUsize = AtomicUsize::new(0);
static REAL_EXECVE: AtomicUsize = AtomicUsize::new(0);
static REAL_EXECV: AtomicUsize = AtomicUsize::new(0);
static REAL_EXECVP: AtomicUsize = AtomicUsize::new(0);
static REAL_EXECVPE: AtomicUsize = AtomicUsize::new(0);

type StartRoutine = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    StartRoutine,
    *mut c_void,
) -> libc::c_int;
type ForkFn = unsafe extern "C" fn() -> libc::pid_t;
type ExecveFn = unsafe extern "C" fn(
    *const libc::c_char,
    *const *const libc::c_char,
    *const *const libc::c_char,
) -> libc::c_int;
type ExecvFn =
    unsafe extern "C" fn(*const libc::c_char, *const *const libc::c_char) -> libc::c_int;

/// Resolve the next definition of `name` in link order, caching the address.
macro_rules! real_fn {
    ($slot:ident, $ty:ty, $name:literal) => {{
        let mut addr = $slot.load(Ordering::Relaxed);
        if addr == 0 {
            addr = unsafe {
                libc::dlsym(libc::RTLD_NEXT, $name.as_ptr() as *const libc::c_char) as usize
            };
            $slot.store(addr, Ordering::Relaxed);
        }
        if addr == 0 {
            unsafe { libc::abort() }
        }
        unsafe { std::mem::transmute::<usize, $ty>(addr) }
    }};
}

fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn control_fd() -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(CONTROL_FD.load(Ordering::Relaxed)) }
}

fn events() -> &'static [String] {
    EVENTS.get().map(Vec::as_slice).unwrap_or(&[])
}

fn gettid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// A send failure means the collector side is gone or confused; keeping the
/// subject running would produce an unattributable trace.
fn die(context: &str) -> ! {
    eprintln!("timeslicer-preload: {context}");
    unsafe { libc::_exit(1) }
}

/// Open, start, and hand off a counter group for `task`. Returns the group
/// so the caller controls when this process's fd copies go away.
fn register_task(task: u32) -> Option<CounterGroup> {
    let group = match CounterGroup::open(task, PERIOD.load(Ordering::Relaxed), events()) {
        Ok(group) => group,
        Err(err) => {
            eprintln!("timeslicer-preload: could not open counters for task {task}: {err}");
            return None;
        }
    };
    if group.enable().is_err() {
        die("could not start the counter group");
    }
    if send_register(control_fd(), task, &group.raw_fds()).is_err() {
        die("could not send counter fds to the collector");
    }
    Some(group)
}

// Runs at load time in the subject, before main: pick up the collector's
// environment and block until it finishes its setup.
#[used]
#[link_section = ".init_array"]
static SHIM_SETUP: unsafe extern "C" fn() = {
    unsafe extern "C" fn setup() {
        shim_setup();
    }
    setup
};

fn shim_setup() {
    let (Ok(fd), Ok(pid), Ok(period)) = (
        std::env::var("COLLECTOR_CONTROL_FD"),
        std::env::var("COLLECTOR_PID"),
        std::env::var("COLLECTOR_PERIOD"),
    ) else {
        return;
    };
    let (Ok(fd), Ok(pid), Ok(period)) =
        (fd.parse::<i32>(), pid.parse::<i32>(), period.parse::<u64>())
    else {
        return;
    };

    CONTROL_FD.store(fd, Ordering::Relaxed);
    COLLECTOR_PID.store(pid, Ordering::Relaxed);
    PERIOD.store(period, Ordering::Relaxed);
    INITIAL_PID.store(unsafe { libc::getpid() }, Ordering::Relaxed);
    let _ = EVENTS.set(
        std::env::var("COLLECTOR_EVENTS")
            .unwrap_or_default()
            .split(',')
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
    );

    // Rendezvous: tell the collector this image is loaded, then wait for it
    // to finish building its maps. SIGUSR2 is blocked (inherited mask), so
    // sigwait is race-free regardless of which side is faster.
    unsafe {
        if libc::kill(pid, libc::SIGUSR2) != 0 {
            die("could not signal the collector");
        }
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR2);
        let mut received: libc::c_int = 0;
        if libc::sigwait(&set, &mut received) != 0 {
            die("failed waiting for the collector's ready signal");
        }
        // give the subject a normal disposition for SIGUSR2 from here on
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }

    ENABLED.store(true, Ordering::Release);
}

// Runs at unload: the initial process tells the collector sampling is over;
// a forked child just retires its own counter group.
#[used]
#[link_section = ".fini_array"]
static SHIM_TEARDOWN: unsafe extern "C" fn() = {
    unsafe extern "C" fn teardown() {
        shim_teardown();
    }
    teardown
};

fn shim_teardown() {
    if !enabled() {
        return;
    }
    let pid = unsafe { libc::getpid() };
    if pid == INITIAL_PID.load(Ordering::Relaxed) {
        unsafe {
            libc::kill(COLLECTOR_PID.load(Ordering::Relaxed), libc::SIGTERM);
        }
    } else {
        let _ = send_unregister(control_fd(), pid as u32);
    }
}

struct Disguise {
    routine: StartRoutine,
    arg: *mut c_void,
}

/// Trampoline for interposed threads: register this task's counters, run
/// the real start routine, unregister on the way out.
unsafe extern "C" fn imposter(raw: *mut c_void) -> *mut c_void {
    let disguise = Box::from_raw(raw as *mut Disguise);
    let tid = gettid();
    let group = register_task(tid);

    let result = (disguise.routine)(disguise.arg);

    if let Some(group) = group {
        let _ = send_unregister(control_fd(), tid);
        group.release();
    }
    result
}

#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: StartRoutine,
    arg: *mut c_void,
) -> libc::c_int {
    let real = real_fn!(REAL_PTHREAD_CREATE, PthreadCreateFn, b"pthread_create\0");
    if !enabled() {
        return real(thread, attr, start_routine, arg);
    }
    let disguise = Box::into_raw(Box::new(Disguise {
        routine: start_routine,
        arg,
    }));
    real(thread, attr, imposter, disguise as *mut c_void)
}

#[no_mangle]
pub unsafe extern "C" fn fork() -> libc::pid_t {
    let real = real_fn!(REAL_FORK, ForkFn, b"fork\0");
    let pid = real();
    if enabled() && pid > 0 {
        // The parent opens and registers the child's group; the child's own
        // exit (fini) unregisters it. The local fd copies are released
        // immediately, ownership now lives with the collector.
        if let Some(group) = register_task(pid as u32) {
            group.release();
        }
    }
    pid
}

fn scrub_preload() {
    // An exec'd image would be attributed against the wrong debug info, so
    // it runs unprofiled.
    unsafe {
        libc::unsetenv(b"LD_PRELOAD\0".as_ptr() as *const libc::c_char);
    }
}

#[no_mangle]
pub unsafe extern "C" fn execve(
    path: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
) -> libc::c_int {
    let real = real_fn!(REAL_EXECVE, ExecveFn, b"execve\0");
    scrub_preload();
    real(path, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn execv(
    path: *const libc::c_char,
    argv: *const *const libc::c_char,
) -> libc::c_int {
    let real = real_fn!(REAL_EXECV, ExecvFn, b"execv\0");
    scrub_preload();
    real(path, argv)
}

#[no_mangle]
pub unsafe extern "C" fn execvp(
    file: *const libc::c_char,
    argv: *const *const libc::c_char,
) -> libc::c_int {
    let real = real_fn!(REAL_EXECVP, ExecvFn, b"execvp\0");
    scrub_preload();
    real(file, argv)
}

#[no_mangle]
pub unsafe extern "C" fn execvpe(
    file: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
) -> libc::c_int {
    let real = real_fn!(REAL_EXECVPE, ExecveFn, b"execvpe\0");
    scrub_preload();
    real(file, argv, envp)
}
