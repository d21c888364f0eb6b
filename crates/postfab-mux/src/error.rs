//! Status-coded call errors.

use postfab_proto::v1::{ErrorCode, FrameStatus};

/// A status-coded failure crossing a frame boundary.
///
/// Handlers return this to reject a call; `CallHandle::call` returns it when
/// the peer rejected the call or the stream terminated underneath it.
#[derive(Debug, Clone)]
pub struct RpcError {
    code: ErrorCode,
    message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", code_name(self.code), self.message)
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedPrecondition, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unimplemented, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    /// The error raised on every in-flight call when the stream ends.
    pub fn stream_terminated() -> Self {
        Self::unavailable("stream terminated")
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<RpcError> for FrameStatus {
    fn from(err: RpcError) -> Self {
        FrameStatus {
            code: err.code as i32,
            message: err.message,
        }
    }
}

impl From<FrameStatus> for RpcError {
    fn from(status: FrameStatus) -> Self {
        let code = ErrorCode::try_from(status.code).unwrap_or(ErrorCode::Internal);
        Self {
            code,
            message: status.message,
        }
    }
}

fn code_name(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Ok => "Ok",
        ErrorCode::InvalidArgument => "InvalidArgument",
        ErrorCode::FailedPrecondition => "FailedPrecondition",
        ErrorCode::AlreadyExists => "AlreadyExists",
        ErrorCode::PermissionDenied => "PermissionDenied",
        ErrorCode::NotFound => "NotFound",
        ErrorCode::DeadlineExceeded => "DeadlineExceeded",
        ErrorCode::Aborted => "Aborted",
        ErrorCode::Internal => "Internal",
        ErrorCode::Unimplemented => "Unimplemented",
        ErrorCode::Unavailable => "Unavailable",
    }
}
