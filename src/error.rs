use thiserror::Error;

/// Errors that can occur during record storage operations. Marked as non-exhaustive to allow for
/// future additions without breaking the API. Callers of the queued operations only ever see
/// `Busy`, `NoSpace` and `LockDown` in a [`Completion`](crate::Completion); flash failures are
/// reported as `Busy`.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The base address has to be aligned to the flash page size
    #[error("invalid base address")]
    InvalidBaseAddress,

    /// At least two pages are needed: one for records and one as swap page
    #[error("invalid page count")]
    InvalidPageCount,

    /// The page size must be a multiple of 4, hold at least one record and fit the 16-bit
    /// record length
    #[error("invalid page size")]
    InvalidPageSize,

    /// A read failed or a flash task reported a failure after all retries
    #[error("internal flash error")]
    FlashError,

    /// The flash queue can not take another task right now
    #[error("flash queue full")]
    QueueFull,

    /// The operation queue is full or the flash reported a failure while executing the operation
    #[error("busy")]
    Busy,

    /// The record does not fit even after defragmentation, or its version counter is exhausted
    #[error("no space")]
    NoSpace,

    /// The storage is locked down for a factory reset
    #[error("locked down")]
    LockDown,

    /// No record with the requested id exists or it has been deactivated
    #[error("record not found")]
    RecordNotFound,
}
