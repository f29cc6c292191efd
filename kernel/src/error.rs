//! Kernel error types
//!
//! Errors are values, never exceptions: every sleep and every access to
//! user memory can fail, and callers check. [`KernelError`] is the
//! kernel-internal error type; at the syscall boundary every variant
//! maps totally onto a negative [`Errno`] value.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    Vm(VmError),
    /// Scheduler-related errors
    Sched(SchedError),
    /// Message-port errors
    Ipc(IpcError),
    /// Filesystem-related errors
    Fs(FsError),

    /// Invalid argument to a kernel call
    InvalidArgument,
    /// Caller lacks the required privilege bit
    PermissionDenied,
    /// A fixed-capacity table is full
    ResourceExhausted {
        resource: &'static str,
    },
    /// Object already exists
    AlreadyExists,
    /// Object does not exist
    NotFound,
    /// Bad user-space address or range
    BadAddress,
    /// Size argument exceeds representable range
    TooBig,
    /// Transfer failed at the device or server
    Io,
    /// Operation not implemented
    NotSupported,
    /// Operation not implemented and never will be on this build
    NoSys,

    /// The calling thread was parked on a Rendez; the in-kernel
    /// trampoline re-issues the operation when the thread next runs.
    WouldBlock,
    /// A sleep was interrupted by a signal, event or cancellation
    Interrupted,
    /// A timed sleep expired before the wakeup arrived
    TimedOut,
    /// Futex value did not match the expected value
    TryAgain,
    /// Write to a pipe with no readers
    BrokenPipe,
}

/// Memory-management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No page frame of a suitable size class is free
    OutOfMemory,
    /// A mapping already exists at the address and `MAP_REPLACE` was
    /// not given
    MappingExists,
    /// No mapping at the address
    NotMapped,
    /// Address or length breaks the user window bounds
    OutOfBounds,
    /// Protection bits forbid the access
    Protection,
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Priority outside the range valid for the policy
    InvalidPriority,
    /// Unknown scheduling policy
    InvalidPolicy,
    /// Thread id is stale or unknown
    ThreadNotFound,
}

/// Message-port errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Port id is stale or unknown
    PortNotFound,
    /// Request id is stale or unknown
    RequestNotFound,
    /// The server side of the port has gone away
    PortClosed,
}

/// Filesystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path component or file not found
    NotFound,
    /// Path already exists
    AlreadyExists,
    /// Descriptor is not open or out of range
    BadDescriptor,
    /// Access check (R_OK/W_OK/X_OK) failed
    AccessDenied,
    /// Operation needs a different file type (e.g. truncate on a
    /// directory)
    WrongType,
    /// Target is not a symbolic link
    NotSymlink,
    /// Per-process descriptor table is full
    TooManyOpenFiles,
    /// The server returned a transfer error
    Io,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Negative errno values returned across the syscall boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    EINTR = 4,
    EIO = 5,
    E2BIG = 7,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EEXIST = 17,
    EINVAL = 22,
    EPIPE = 32,
    ENOSYS = 38,
    ENOLINK = 67,
    ENOTSUP = 95,
    ETIMEDOUT = 110,
}

impl Errno {
    /// Encode as the negative return value user mode sees.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }
}

impl KernelError {
    /// Total mapping onto the errno taxonomy.
    pub fn errno(&self) -> Errno {
        match self {
            Self::Vm(VmError::OutOfMemory) => Errno::ENOMEM,
            Self::Vm(VmError::MappingExists) => Errno::EEXIST,
            Self::Vm(VmError::NotMapped) => Errno::EFAULT,
            Self::Vm(VmError::OutOfBounds) => Errno::EFAULT,
            Self::Vm(VmError::Protection) => Errno::EACCES,

            Self::Sched(SchedError::InvalidPriority) => Errno::EINVAL,
            Self::Sched(SchedError::InvalidPolicy) => Errno::EINVAL,
            Self::Sched(SchedError::ThreadNotFound) => Errno::EINVAL,

            Self::Ipc(IpcError::PortNotFound) => Errno::EINVAL,
            Self::Ipc(IpcError::RequestNotFound) => Errno::EINVAL,
            Self::Ipc(IpcError::PortClosed) => Errno::EIO,

            Self::Fs(FsError::NotFound) => Errno::ENOENT,
            Self::Fs(FsError::AlreadyExists) => Errno::EEXIST,
            Self::Fs(FsError::BadDescriptor) => Errno::EINVAL,
            Self::Fs(FsError::AccessDenied) => Errno::EACCES,
            Self::Fs(FsError::WrongType) => Errno::EINVAL,
            Self::Fs(FsError::NotSymlink) => Errno::ENOLINK,
            Self::Fs(FsError::TooManyOpenFiles) => Errno::EINVAL,
            Self::Fs(FsError::Io) => Errno::EIO,

            Self::InvalidArgument => Errno::EINVAL,
            Self::PermissionDenied => Errno::EPERM,
            Self::ResourceExhausted { .. } => Errno::ENOMEM,
            Self::AlreadyExists => Errno::EEXIST,
            Self::NotFound => Errno::ENOENT,
            Self::BadAddress => Errno::EFAULT,
            Self::TooBig => Errno::E2BIG,
            Self::Io => Errno::EIO,
            Self::NotSupported => Errno::ENOTSUP,
            Self::NoSys => Errno::ENOSYS,

            // WouldBlock never reaches user mode: the trampoline
            // re-issues the parked operation. Encode it as EAGAIN for
            // the rare diagnostic path that formats it anyway.
            Self::WouldBlock => Errno::EAGAIN,
            Self::Interrupted => Errno::EINTR,
            Self::TimedOut => Errno::ETIMEDOUT,
            Self::TryAgain => Errno::EAGAIN,
            Self::BrokenPipe => Errno::EPIPE,
        }
    }

    /// Encode as the negative isize returned to user mode.
    pub fn as_isize(&self) -> isize {
        self.errno().as_isize()
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vm(e) => write!(f, "vm error: {:?}", e),
            Self::Sched(e) => write!(f, "scheduler error: {:?}", e),
            Self::Ipc(e) => write!(f, "message port error: {:?}", e),
            Self::Fs(e) => write!(f, "filesystem error: {:?}", e),
            Self::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<VmError> for KernelError {
    fn from(err: VmError) -> Self {
        Self::Vm(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::Ipc(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}
