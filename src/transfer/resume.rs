//! Resume decision for a stream file already on disk
//!
//! Kept free of I/O so every branch can be tested directly.

use super::probe::RemoteInfo;

/// How a transfer attempt should treat the bytes already on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Nothing usable on disk; fetch from byte 0
    Fresh,
    /// Append from `offset`
    Resume {
        /// Bytes already on disk
        offset: u64,
    },
    /// Local bytes cannot be trusted; truncate and fetch from byte 0
    Restart,
    /// File already holds exactly the server-reported size
    AlreadyComplete,
}

impl ResumeDecision {
    /// Offset the request should start at
    pub fn offset(self) -> u64 {
        match self {
            ResumeDecision::Resume { offset } => offset,
            _ => 0,
        }
    }
}

/// Decide how to continue given `local_len` bytes on disk
///
/// Local bytes are only trusted against a server-reported total: an unknown
/// total, a file longer than the resource, or a server without range support
/// all force a restart.
pub fn decide_resume(local_len: u64, remote: &RemoteInfo) -> ResumeDecision {
    if local_len == 0 {
        return match remote.total {
            Some(0) => ResumeDecision::AlreadyComplete,
            _ => ResumeDecision::Fresh,
        };
    }

    let Some(total) = remote.total else {
        return ResumeDecision::Restart;
    };

    if local_len == total {
        ResumeDecision::AlreadyComplete
    } else if local_len > total || !remote.accepts_ranges {
        ResumeDecision::Restart
    } else {
        ResumeDecision::Resume { offset: local_len }
    }
}
