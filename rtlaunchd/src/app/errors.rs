// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    // Connection failures.
    pub const VPN_TIMEOUT: &str = "vpn_timeout";
    pub const AUTHENTICATION_REJECTED: &str = "authentication_rejected";
    pub const HOST_UNREACHABLE: &str = "host_unreachable";
    pub const CREDENTIALS_MISSING: &str = "credentials_missing";
    pub const UNSUPPORTED_PROTOCOL: &str = "unsupported_protocol";

    // Submission failures.
    pub const MALFORMED_JOB_SCRIPT: &str = "malformed_job_script";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const SUBMISSION_REJECTED: &str = "submission_rejected";

    pub const OUTPUT_MISSING: &str = "output_missing";
    pub const JOB_NOT_FINISHED: &str = "job_not_finished";

    // Tracker consistency.
    pub const ILLEGAL_TRANSITION: &str = "illegal_transition";
    pub const UNKNOWN_JOB: &str = "unknown_job";
    pub const UNKNOWN_HOST: &str = "unknown_host";

    pub const REMOTE_ERROR: &str = "remote_error";
    pub const LOCAL_ERROR: &str = "local_error";
    pub const STORE_ERROR: &str = "store_error";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    Connection,
    Submission,
    Integrity,
    NotFound,
    InvalidArgument,
    Output,
    Remote,
    Local,
    Internal,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Transient errors are recovered locally with back-off; everything else
    /// is surfaced to the caller as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            codes::VPN_TIMEOUT | codes::HOST_UNREACHABLE | codes::REMOTE_ERROR
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

pub fn invalid_argument(message: impl Into<String>) -> AppError {
    AppError::with_message(
        AppErrorKind::InvalidArgument,
        codes::INVALID_ARGUMENT,
        message,
    )
}

pub fn remote_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Remote, codes::REMOTE_ERROR, message)
}

pub fn local_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Local, codes::LOCAL_ERROR, message)
}

pub fn unknown_job(id: i64) -> AppError {
    AppError::with_message(
        AppErrorKind::NotFound,
        codes::UNKNOWN_JOB,
        format!("job {id} is not tracked"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = AppError::with_message(
            AppErrorKind::Connection,
            codes::HOST_UNREACHABLE,
            "no route to host",
        )
        .with_context("nancy");
        assert_eq!(err.to_string(), "no route to host (nancy)");
        assert_eq!(err.context(), Some("nancy"));
    }

    #[test]
    fn only_connectivity_codes_are_transient() {
        assert!(AppError::new(AppErrorKind::Connection, codes::VPN_TIMEOUT).is_transient());
        assert!(AppError::new(AppErrorKind::Connection, codes::HOST_UNREACHABLE).is_transient());
        assert!(remote_error("channel closed").is_transient());
        assert!(
            !AppError::new(AppErrorKind::Connection, codes::AUTHENTICATION_REJECTED).is_transient()
        );
        assert!(!AppError::new(AppErrorKind::Submission, codes::QUOTA_EXCEEDED).is_transient());
        assert!(!unknown_job(3).is_transient());
    }
}
