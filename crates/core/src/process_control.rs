//! Platform primitives for suspending, resuming and killing the encoder.
//!
//! The supervisor only talks to [`ProcessControl`]; [`platform_control`]
//! picks the implementation for the current OS once at startup.

use std::io;
use std::sync::Arc;

/// OS identity of a spawned encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTarget {
    pub pid: u32,
    /// Raw process handle; only meaningful on Windows.
    pub handle: usize,
}

pub trait ProcessControl: Send + Sync {
    fn suspend(&self, target: &ProcessTarget) -> io::Result<()>;
    fn resume(&self, target: &ProcessTarget) -> io::Result<()>;
    /// Forcefully terminate the process and everything it spawned.
    fn terminate(&self, target: &ProcessTarget) -> io::Result<()>;
}

/// Control implementation for the running OS.
pub fn platform_control() -> Arc<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Arc::new(unix::SignalControl)
    }
    #[cfg(windows)]
    {
        Arc::new(windows::NativeControl)
    }
}

#[cfg(unix)]
pub use unix::SignalControl;

#[cfg(unix)]
mod unix {
    use super::{ProcessControl, ProcessTarget};
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use std::io;

    /// Signals the encoder's process group, which the supervisor creates per spawn.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SignalControl;

    impl SignalControl {
        fn signal_group(target: &ProcessTarget, signal: Signal) -> io::Result<()> {
            let pid = i32::try_from(target.pid)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
            match killpg(Pid::from_raw(pid), signal) {
                // Already gone
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(errno) => Err(io::Error::from(errno)),
            }
        }
    }

    impl ProcessControl for SignalControl {
        fn suspend(&self, target: &ProcessTarget) -> io::Result<()> {
            Self::signal_group(target, Signal::SIGSTOP)
        }

        fn resume(&self, target: &ProcessTarget) -> io::Result<()> {
            Self::signal_group(target, Signal::SIGCONT)
        }

        fn terminate(&self, target: &ProcessTarget) -> io::Result<()> {
            Self::signal_group(target, Signal::SIGKILL)
        }
    }
}

#[cfg(windows)]
pub use windows::NativeControl;

#[cfg(windows)]
mod windows {
    use super::{ProcessControl, ProcessTarget};
    use std::ffi::c_void;
    use std::io;
    use std::process::{Command, Stdio};

    #[link(name = "ntdll")]
    extern "system" {
        fn NtSuspendProcess(process: *mut c_void) -> i32;
        fn NtResumeProcess(process: *mut c_void) -> i32;
    }

    /// Native suspend/resume on the process handle, `taskkill /T` for the tree.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NativeControl;

    fn check_status(status: i32) -> io::Result<()> {
        if status < 0 {
            Err(io::Error::other(format!("NTSTATUS {:#010x}", status)))
        } else {
            Ok(())
        }
    }

    impl ProcessControl for NativeControl {
        fn suspend(&self, target: &ProcessTarget) -> io::Result<()> {
            // SAFETY: the handle belongs to a child the supervisor has not reaped yet
            check_status(unsafe { NtSuspendProcess(target.handle as *mut c_void) })
        }

        fn resume(&self, target: &ProcessTarget) -> io::Result<()> {
            // SAFETY: as above
            check_status(unsafe { NtResumeProcess(target.handle as *mut c_void) })
        }

        fn terminate(&self, target: &ProcessTarget) -> io::Result<()> {
            Command::new("taskkill")
                .args(["/PID", &target.pid.to_string(), "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|_| ())
        }
    }
}
