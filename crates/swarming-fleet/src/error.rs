use swarming_core::CancelReason;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetErrorKind {
    NotFound,
    Transient,
    Fatal,
    Cancelled,
    Config,
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{method}: not found: {message}")]
    NotFound { method: String, message: String },
    #[error("{method}: transient failure (code {code}): {message}")]
    Transient {
        method: String,
        code: GrpcCode,
        message: String,
    },
    #[error("{method}: failed (code {code}): {message}")]
    Fatal {
        method: String,
        code: GrpcCode,
        message: String,
    },
    #[error("{method}: {message}")]
    Malformed { method: String, message: String },
    #[error("{method}: cancelled: {reason}")]
    Cancelled { method: String, reason: CancelReason },
    #[error("fleet client misconfigured: {0}")]
    Config(String),
    #[error("{method}: giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        method: String,
        attempts: usize,
        last: Box<FleetError>,
    },
}

impl FleetError {
    pub fn kind(&self) -> FleetErrorKind {
        match self {
            FleetError::NotFound { .. } => FleetErrorKind::NotFound,
            FleetError::Transient { .. } => FleetErrorKind::Transient,
            FleetError::Fatal { .. } | FleetError::Malformed { .. } => FleetErrorKind::Fatal,
            FleetError::Cancelled { .. } => FleetErrorKind::Cancelled,
            FleetError::Config(_) => FleetErrorKind::Config,
            FleetError::RetriesExhausted { last, .. } => match last.kind() {
                FleetErrorKind::Transient => FleetErrorKind::Fatal,
                other => other,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == FleetErrorKind::NotFound
    }

    pub fn from_code(method: &str, code: GrpcCode, message: impl Into<String>) -> Self {
        let method = method.to_string();
        let message = message.into();
        if code == GrpcCode::NotFound {
            return FleetError::NotFound { method, message };
        }
        if code.is_transient() {
            FleetError::Transient {
                method,
                code,
                message,
            }
        } else {
            FleetError::Fatal {
                method,
                code,
                message,
            }
        }
    }

    pub fn malformed(method: &str, message: impl Into<String>) -> Self {
        FleetError::Malformed {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

/// gRPC status codes as carried by pRPC responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl GrpcCode {
    pub fn from_i32(code: i32) -> GrpcCode {
        match code {
            0 => GrpcCode::Ok,
            1 => GrpcCode::Cancelled,
            3 => GrpcCode::InvalidArgument,
            4 => GrpcCode::DeadlineExceeded,
            5 => GrpcCode::NotFound,
            6 => GrpcCode::AlreadyExists,
            7 => GrpcCode::PermissionDenied,
            8 => GrpcCode::ResourceExhausted,
            9 => GrpcCode::FailedPrecondition,
            10 => GrpcCode::Aborted,
            11 => GrpcCode::OutOfRange,
            12 => GrpcCode::Unimplemented,
            13 => GrpcCode::Internal,
            14 => GrpcCode::Unavailable,
            15 => GrpcCode::DataLoss,
            16 => GrpcCode::Unauthenticated,
            _ => GrpcCode::Unknown,
        }
    }

    /// Best-effort mapping for responses that carry no grpc code header.
    pub fn from_http_status(status: u16) -> GrpcCode {
        match status {
            200 => GrpcCode::Ok,
            400 => GrpcCode::InvalidArgument,
            401 => GrpcCode::Unauthenticated,
            403 => GrpcCode::PermissionDenied,
            404 => GrpcCode::NotFound,
            408 | 504 => GrpcCode::DeadlineExceeded,
            409 => GrpcCode::Aborted,
            429 => GrpcCode::ResourceExhausted,
            501 => GrpcCode::Unimplemented,
            502 | 503 => GrpcCode::Unavailable,
            500 => GrpcCode::Internal,
            _ => GrpcCode::Unknown,
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            GrpcCode::Unavailable
                | GrpcCode::DeadlineExceeded
                | GrpcCode::ResourceExhausted
                | GrpcCode::Aborted
                | GrpcCode::Internal
                | GrpcCode::Unknown
        )
    }
}

impl std::fmt::Display for GrpcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_codes() {
        assert!(FleetError::from_code("GetMachine", GrpcCode::NotFound, "x").is_not_found());
        assert!(FleetError::from_code("GetMachine", GrpcCode::Unavailable, "x").is_transient());
        assert_eq!(
            FleetError::from_code("GetMachine", GrpcCode::PermissionDenied, "x").kind(),
            FleetErrorKind::Fatal
        );
    }

    #[test]
    fn exhausted_transient_counts_as_fatal() {
        let exhausted = FleetError::RetriesExhausted {
            method: "UpdateDutState".to_string(),
            attempts: 3,
            last: Box::new(FleetError::from_code(
                "UpdateDutState",
                GrpcCode::Unavailable,
                "down",
            )),
        };
        assert_eq!(exhausted.kind(), FleetErrorKind::Fatal);
        assert!(exhausted.to_string().contains("giving up after 3 attempts"));
    }

    #[test]
    fn http_status_fallback() {
        assert_eq!(GrpcCode::from_http_status(503), GrpcCode::Unavailable);
        assert_eq!(GrpcCode::from_http_status(404), GrpcCode::NotFound);
        assert_eq!(GrpcCode::from_i32(14), GrpcCode::Unavailable);
        assert_eq!(GrpcCode::from_i32(99), GrpcCode::Unknown);
    }
}
