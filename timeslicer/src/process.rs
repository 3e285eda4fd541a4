//! Launching the subject in a suspended state: fork, park the child on a
//! pipe until the collector has finished its setup, then exec the command
//! with the interposition shim and the control-socket fd in its environment.

use std::ffi::{CString, OsStr, OsString};
use std::os::fd::OwnedFd;
use std::os::raw::c_char;
use std::os::unix::prelude::OsStrExt;

use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;

pub struct SuspendedSubject {
    pid: Pid,
    resume_write: OwnedFd,
    execerr_read: OwnedFd,
}

impl SuspendedSubject {
    /// Fork now; the child blocks on a pipe and execs only once
    /// [`SuspendedSubject::resume`] is called. `extra_env` is layered over
    /// the inherited environment.
    pub fn launch(
        command: &OsStr,
        args: &[OsString],
        extra_env: &[(OsString, OsString)],
    ) -> std::io::Result<SuspendedSubject> {
        let argv: Vec<CString> = std::iter::once(command)
            .chain(args.iter().map(|a| a.as_os_str()))
            .map(|arg| {
                CString::new(arg.as_bytes().to_vec()).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "nul byte in argument")
                })
            })
            .collect::<Result<_, _>>()?;
        let argv_ptrs: Vec<*const c_char> = argv
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let mut env: Vec<CString> = Vec::new();
        for (key, value) in std::env::vars_os() {
            if extra_env.iter().any(|(k, _)| *k == key) {
                continue;
            }
            env.push(env_entry(&key, &value)?);
        }
        for (key, value) in extra_env {
            env.push(env_entry(key, value)?);
        }
        let env_ptrs: Vec<*const c_char> = env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let (resume_read, resume_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        let (execerr_read, execerr_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;

        match unsafe { nix::unistd::fork() }? {
            nix::unistd::ForkResult::Child => {
                drop(resume_write);
                drop(execerr_read);
                run_child(resume_read, execerr_write, &argv_ptrs, &env_ptrs)
            }
            nix::unistd::ForkResult::Parent { child } => {
                drop(resume_read);
                drop(execerr_write);
                Ok(SuspendedSubject {
                    pid: child,
                    resume_write,
                    execerr_read,
                })
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Let the child exec. Returns once the exec has either succeeded or
    /// failed; a failed exec surfaces the child's errno.
    pub fn resume(self) -> std::io::Result<RunningSubject> {
        nix::unistd::write(&self.resume_write, &[1])?;
        drop(self.resume_write);

        loop {
            let mut bytes = [0u8; 4];
            match nix::unistd::read(&self.execerr_read, &mut bytes) {
                Ok(0) => break, // pipe closed on exec: success
                Ok(4) => {
                    let errno = i32::from_ne_bytes(bytes);
                    let _ = nix::sys::wait::waitpid(self.pid, None);
                    return Err(std::io::Error::from_raw_os_error(errno));
                }
                Ok(_) => {
                    let _ = nix::sys::wait::waitpid(self.pid, None);
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "short read on the exec error pipe",
                    ));
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(RunningSubject { pid: self.pid })
    }
}

fn env_entry(key: &OsStr, value: &OsStr) -> std::io::Result<CString> {
    let mut bytes = key.as_bytes().to_vec();
    bytes.push(b'=');
    bytes.extend_from_slice(value.as_bytes());
    CString::new(bytes)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "nul byte in env"))
}

/// Runs in the forked child; never returns.
fn run_child(
    resume_read: OwnedFd,
    execerr_write: OwnedFd,
    argv: &[*const c_char],
    envp: &[*const c_char],
) -> ! {
    // The collector blocks SIGTERM, SIGUSR2, and SIGCHLD before forking.
    // SIGUSR2 must stay blocked so the shim can sigwait it race-free; the
    // others go back to normal delivery for the subject.
    let mut unblock = SigSet::empty();
    unblock.add(Signal::SIGTERM);
    unblock.add(Signal::SIGCHLD);
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None);

    loop {
        let mut buf = [0u8; 1];
        match nix::unistd::read(&resume_read, &mut buf) {
            // parent died or gave up before resuming
            Ok(0) => std::process::exit(0),
            Ok(_) => {
                unsafe { libc::execvpe(argv[0], argv.as_ptr(), envp.as_ptr()) };
                // only reachable when the exec failed
                let errno = nix::errno::Errno::last_raw().to_ne_bytes();
                let _ = nix::unistd::write(&execerr_write, &errno);
                unsafe { libc::_exit(1) }
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(_) => std::process::exit(1),
        }
    }
}

pub struct RunningSubject {
    pid: Pid,
}

impl RunningSubject {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Non-blocking reap, used at collector shutdown when the subject has
    /// already exited.
    pub fn try_reap(&self) {
        use nix::sys::wait::{waitpid, WaitPidFlag};
        let _ = waitpid(self.pid, Some(WaitPidFlag::WNOHANG));
    }
}
