use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DforkError>;

/// Errors surfaced by every dfork operation.
///
/// Each variant maps onto a negative errno through [`DforkError::errno`], which is
/// the result code a request reports to its completion callback.
#[derive(Error, Debug)]
pub enum DforkError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is busy")]
    Busy(String),

    #[error("{0} is not empty")]
    NotEmpty(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("malformed reply: {0}")]
    BadMessage(String),

    #[error("remote operation on {context} failed with errno {errno}")]
    Remote { errno: i32, context: String },

    #[error("request task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DforkError {
    /// Negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -libc::EINVAL,
            Self::NotFound(_) => -libc::ENOENT,
            Self::Busy(_) => -libc::EBUSY,
            Self::NotEmpty(_) => -libc::ENOTEMPTY,
            Self::NotSupported(_) => -libc::EOPNOTSUPP,
            Self::BadMessage(_) | Self::Codec(_) | Self::Json(_) => -libc::EBADMSG,
            Self::Remote { errno, .. } => -errno.abs(),
            Self::Task(_) => -libc::EIO,
            Self::Io(e) => match e.raw_os_error() {
                Some(errno) => -errno,
                None if e.kind() == io::ErrorKind::NotFound => -libc::ENOENT,
                None => -libc::EIO,
            },
        }
    }

    /// Builds the error a store reports for `errno` while operating on `context`.
    pub fn from_errno(errno: i32, context: impl Into<String>) -> Self {
        let context = context.into();
        match errno.abs() {
            libc::EINVAL => Self::InvalidArgument(context),
            libc::ENOENT => Self::NotFound(context),
            libc::EBUSY => Self::Busy(context),
            libc::ENOTEMPTY => Self::NotEmpty(context),
            libc::EOPNOTSUPP => Self::NotSupported(context),
            libc::EBADMSG => Self::BadMessage(context),
            errno => Self::Remote { errno, context },
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.errno() == -libc::ENOENT
    }
}

/// Converts a request outcome into the classic `0 / -errno` result code.
pub fn result_code<T>(r: &Result<T>) -> i32 {
    match r {
        Ok(_) => 0,
        Err(e) => e.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_round_trip() {
        for errno in [libc::EINVAL, libc::ENOENT, libc::EBUSY, libc::ENOTEMPTY, libc::EIO] {
            let err = DforkError::from_errno(-errno, "rbd_header.abc");
            assert_eq!(err.errno(), -errno);
        }
    }

    #[test]
    fn test_result_code() {
        assert_eq!(result_code(&Ok::<_, DforkError>(())), 0);
        let r: Result<()> = Err(DforkError::NotFound("rbd_id.foo".into()));
        assert_eq!(result_code(&r), -libc::ENOENT);
        assert!(r.unwrap_err().is_not_found());
    }
}
