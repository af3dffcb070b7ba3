//! Kernel layer: the process-wide resources an `emu-core` execution engine
//! needs from "the OS side" — scheduler, futex table, FD table, VFS, and the
//! syscall dispatcher that routes guest traps into them.
//!
//! `emu-core` knows nothing about any of this; it hands back a
//! [`emu_core::GuestTrap::Syscall`] and this crate decides what that means.
//! The split mirrors the crate boundary the rest of the workspace draws
//! between "CPU core" and "kernel" concerns.

pub mod engine;
pub mod error;
pub mod fdtable;
pub mod futex;
pub mod loader;
pub mod path;
pub mod process;
pub mod scheduler;
pub mod syscall;
pub mod vfs;

pub use engine::{run_to_completion, Engine, EngineConfig};
pub use error::{verification_failed, Errno, KernelError};
pub use loader::ProgramLoader;
pub use process::Process;
pub use scheduler::{Scheduler, ThreadId};
