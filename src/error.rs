//! Error types for devbuf.

use thiserror::Error;

/// Result type alias using devbuf's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer and doorbell allocation.
///
/// Freeing memory that no live segment or doorbell page owns is not an
/// error variant: it is a programming error and panics.
#[derive(Error, Debug)]
pub enum Error {
    /// The kernel could not provide a backing segment or mapping.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The kernel reported that the requested capability is not supported.
    ///
    /// Never retried: the answer will not change for this device.
    #[error("capability not supported: {0}")]
    CapabilityAbsent(String),

    /// A custom or external allocator hook failed to provide memory.
    #[error("allocator hook failed: {0}")]
    HookFailed(String),

    /// Registering a region with the fork-exclusion service failed.
    #[error("fork exclusion failed for {len} bytes at {addr:#x}: {source}")]
    ForkExclusion {
        /// Start of the region.
        addr: usize,
        /// Length of the region in bytes.
        len: usize,
        /// Underlying system error.
        #[source]
        source: rustix::io::Errno,
    },

    /// A request was malformed (zero size where one is required, bad alignment).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ResourceExhausted("no huge pages".into());
        assert_eq!(err.to_string(), "resource exhausted: no huge pages");

        let err = Error::ForkExclusion {
            addr: 0x1000,
            len: 4096,
            source: rustix::io::Errno::INVAL,
        };
        assert!(err.to_string().contains("0x1000"));
        assert!(err.to_string().contains("4096"));
    }
}
