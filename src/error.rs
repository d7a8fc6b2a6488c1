use std::{fmt::Display, fmt::Formatter, io};

#[derive(Debug)]
pub enum Error {
    /// Caller supplied a key longer than `max_key_length`. Map state is unchanged.
    KeyTooLong {
        /// Length of the offending key.
        supplied: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Caller supplied a value longer than `max_value_length`. Map state is unchanged.
    ValueTooLong {
        /// Length of the offending value.
        supplied: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Directory is already at `max_table_size` and the filled bucket cannot
    /// accept another overflow bucket under the load-factor limit.
    MapFull,
    /// Directory resize would overflow the addressable arena.
    CapacityOverflow,
    /// IO error, propagated from the backing Store.
    Io(io::Error),
    /// A future was already completed (or closed) when `complete` was called.
    AlreadyCompleted,
    /// `get()` was called from a thread that is not permitted to block.
    BlockingNotPermitted,
    /// Operation is not supported (e.g. cancelling a future).
    Unsupported,
    /// An iterator observed a structural modification of the map mid-walk.
    ConcurrentModification,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
