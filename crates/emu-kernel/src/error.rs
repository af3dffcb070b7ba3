//! Guest-visible errno values and the host-side verification-failure tier.
//!
//! This crate's three error tiers mirror the architectural split the core
//! draws between them: a syscall handler that cannot complete returns an
//! [`Errno`] (tier 1, purely data, never unwinds); a [`emu_core::GuestTrap`]
//! bubbling out of the execution engine becomes a guest signal or thread
//! termination (tier 2, handled in `dispatch`); and [`verify!`] is the
//! escape hatch for "this should be unreachable" host bugs (tier 3), which
//! abort the whole emulator rather than letting a guest observe undefined
//! internal state.

use std::fmt;

/// A negative errno value as returned to the guest from a syscall handler.
/// Always `<= 0`; `Errno(0)` is not a valid error and should not be
/// constructed (syscalls report success by returning an `i64` directly,
/// not through this type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const EPERM: Errno = Errno(-libc::EPERM);
    pub const ENOENT: Errno = Errno(-libc::ENOENT);
    pub const EBADF: Errno = Errno(-libc::EBADF);
    pub const EAGAIN: Errno = Errno(-libc::EAGAIN);
    pub const ENOMEM: Errno = Errno(-libc::ENOMEM);
    pub const EACCES: Errno = Errno(-libc::EACCES);
    pub const EFAULT: Errno = Errno(-libc::EFAULT);
    pub const EEXIST: Errno = Errno(-libc::EEXIST);
    pub const ENOTDIR: Errno = Errno(-libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(-libc::EISDIR);
    pub const EINVAL: Errno = Errno(-libc::EINVAL);
    pub const ESPIPE: Errno = Errno(-libc::ESPIPE);
    pub const ENOTTY: Errno = Errno(-libc::ENOTTY);
    pub const ENOSYS: Errno = Errno(-libc::ENOSYS);
    pub const ETIMEDOUT: Errno = Errno(-libc::ETIMEDOUT);
    pub const ECHILD: Errno = Errno(-libc::ECHILD);
    pub const EINTR: Errno = Errno(-libc::EINTR);
    pub const ENOTSOCK: Errno = Errno(-libc::ENOTSOCK);

    /// The raw `i64` a syscall handler hands back over the guest ABI.
    pub fn as_ret(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", -self.0)
    }
}

impl std::error::Error for Errno {}

impl From<std::io::Error> for Errno {
    /// Host I/O failures are translated by their raw errno when the host
    /// supplied one, and otherwise collapsed to `EIO`-equivalent via
    /// `EINVAL` (there is no portable `errno` for e.g. a host `WouldBlock`
    /// synthesized by a non-Unix backend, which this emulator never runs
    /// on, but the fallback keeps the conversion total).
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Errno(-code),
            None => Errno::EINVAL,
        }
    }
}

/// Thrown by VFS/FD-table plumbing that wants `?` but ultimately unwraps to
/// an [`Errno`] at the syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct KernelError(pub Errno);

impl From<Errno> for KernelError {
    fn from(e: Errno) -> Self {
        KernelError(e)
    }
}

impl From<KernelError> for Errno {
    fn from(e: KernelError) -> Self {
        e.0
    }
}

/// Host-side verification failure: an internal invariant the rest of the
/// emulator depends on has been violated. Never guest-triggerable by
/// design; reaching this is always a bug in this crate or `emu-core`.
///
/// A `verify(cond, message)` assertion for "should not happen" checks that
/// are too load-bearing to silently `unwrap`.
#[macro_export]
macro_rules! verify {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::error::verification_failed(format!($($arg)*));
        }
    };
}

#[doc(hidden)]
pub fn verification_failed(message: String) -> ! {
    tracing::error!(target: "emu_kernel::verify", "{message}");
    eprintln!("emu-kernel: internal verification failure: {message}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_with_raw_os_error_maps_through() {
        let io_err = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(Errno::from(io_err), Errno::ENOENT);
    }

    #[test]
    fn as_ret_is_negative_of_errno_number() {
        assert_eq!(Errno::EBADF.as_ret(), -(libc::EBADF as i64));
    }
}
