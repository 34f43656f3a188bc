//! Native return and reason codes.
//!
//! The unauthorized services report z/OS UNIX errno values as return codes;
//! the authorized IWM services report a severity return code with the detail
//! in the low halfword of the reason code. Both are folded into a single
//! [`FailureKind`] so callers never look at raw numbers.

/// Successful completion.
pub const RC_OK: i32 = 0;
/// IWM error severity.
pub const RC_IWM_ERROR: i32 = 8;
/// IWM severe error severity.
pub const RC_IWM_SEVERE: i32 = 12;

/// errno: permission denied.
pub const EACCES: i32 = 111;
/// errno: not enough storage.
pub const ENOMEM: i32 = 132;
/// errno: operation not permitted.
pub const EPERM: i32 = 139;

/// IWM reason: caller not authorized to the requested service.
pub const RSN_NOT_AUTHORIZED: i32 = 0x0804;
/// IWM reason: the security product could not extract the caller's profile.
pub const RSN_SAF_EXTRACT_ERROR: i32 = 0x0C0A;
/// IWM reason: no storage available for the request.
pub const RSN_NO_STORAGE: i32 = 0x0820;
/// IWM reason: the enclave is already joined by this dispatchable unit.
pub const RSN_ALREADY_JOINED: i32 = 0x0835;

/// Category of a failed native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Refused by the security product. Always raised to the caller.
    SecurityDenied,
    /// The native side ran out of storage.
    OutOfMemory,
    /// The thread already holds a joined enclave.
    AlreadyJoined,
    /// Any other WLM failure.
    Unspecified,
}

impl FailureKind {
    /// Classify a return/reason code pair.
    pub fn classify(return_code: i32, reason_code: i32) -> Self {
        let detail = reason_code & 0xFFFF;
        match return_code {
            EACCES | EPERM => Self::SecurityDenied,
            ENOMEM => Self::OutOfMemory,
            RC_IWM_ERROR | RC_IWM_SEVERE => match detail {
                RSN_NOT_AUTHORIZED | RSN_SAF_EXTRACT_ERROR => Self::SecurityDenied,
                RSN_NO_STORAGE => Self::OutOfMemory,
                RSN_ALREADY_JOINED => Self::AlreadyJoined,
                _ => Self::Unspecified,
            },
            _ => Self::Unspecified,
        }
    }

    /// Short label used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityDenied => "SECURITY",
            Self::OutOfMemory => "NOSTORAGE",
            Self::AlreadyJoined => "JOINED",
            Self::Unspecified => "WLM",
        }
    }
}
