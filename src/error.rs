use std::fmt;

/// Soft failures surfaced to the host runtime. Structural corruption
/// (allocation during collection, unknown kind tags) aborts the process
/// instead; see the `bug!` macro.
#[derive(Debug)]
pub enum Error {
    /// The tracked allocator or the cell allocator ran out of memory even
    /// after a rescue collection.
    OutOfMemory,
    /// A negative (or wrapped-around) allocation size reached the tracked
    /// allocator.
    NegativeAllocation(&'static str),
    /// `n * size` overflowed in a counted allocation.
    SizeOverflow(&'static str),
    /// The argument cannot carry a finalizer (immediates have no cell).
    CannotFinalize,
    /// `id_to_ref` was handed a word that is not an object id.
    NotIdValue(usize),
    /// `id_to_ref` was handed the id of an object that has been swept.
    RecycledObject(usize),
    /// Carrier for failures raised out of user finalizers; the runner
    /// drops these after logging.
    FinalizerFailed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "failed to allocate memory"),
            Error::NegativeAllocation(what) => {
                write!(f, "negative allocation size (or too big): {}", what)
            }
            Error::SizeOverflow(what) => write!(f, "{}: possible integer overflow", what),
            Error::CannotFinalize => write!(f, "cannot define finalizer for immediate value"),
            Error::NotIdValue(id) => write!(f, "{:#x} is not id value", id),
            Error::RecycledObject(id) => write!(f, "{:#x} is recycled object", id),
            Error::FinalizerFailed(msg) => write!(f, "finalizer failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Unrecoverable heap corruption. Mirrors the host contract: print and
/// abort, never unwind through the collector.
macro_rules! bug {
    ($($arg:tt)*) => {{
        eprintln!("[BUG] {}", format_args!($($arg)*));
        std::process::abort();
    }};
}

pub(crate) use bug;
