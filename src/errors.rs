use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    AuthExpired,
    NotLinked,
    InvalidProjectOrOrg,
    BuildFailed,
    LintOrTypeCheckFailed,
    EnvMissing,
    ModuleNotFound,
    PermissionDenied,
    NetworkError,
    Timeout,
    IdleTimeout,
    UnknownProviderError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::NotLinked => "NOT_LINKED",
            Self::InvalidProjectOrOrg => "INVALID_PROJECT_OR_ORG",
            Self::BuildFailed => "BUILD_FAILED",
            Self::LintOrTypeCheckFailed => "LINT_OR_TYPE_CHECK_FAILED",
            Self::EnvMissing => "ENV_MISSING",
            Self::ModuleNotFound => "MODULE_NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::IdleTimeout => "IDLE_TIMEOUT",
            Self::UnknownProviderError => "UNKNOWN_PROVIDER_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure raised by a provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub provider: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remedy: Option<String>,
    /// Recent output tail of the failing invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_url: Option<String>,
}

impl ProviderError {
    pub fn new(code: ErrorCode, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            provider: provider.into(),
            message: message.into(),
            remedy: None,
            detail: None,
            url: None,
            logs_url: None,
        }
    }

    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.remedy = Some(remedy.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.trim().is_empty() {
            self.detail = Some(detail);
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CLI_INVALID: {0}")]
    Cli(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("PROVIDER: {0}")]
    Provider(ProviderError),
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Provider(error) => Some(error),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Cli(_) => "CLI_INVALID",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Io(_) => "IO_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Provider(error) => error.code.as_str(),
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(value: ProviderError) -> Self {
        Self::Provider(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::{AppError, ErrorCode, ProviderError};

    #[test]
    fn provider_error_display_carries_code() {
        let error = ProviderError::new(ErrorCode::NotLinked, "vercel", "not linked")
            .with_remedy("Run: vercel link");
        let wrapped = AppError::from(error);
        assert_eq!(wrapped.to_string(), "PROVIDER: NOT_LINKED: not linked");
        assert_eq!(
            wrapped.provider_error().and_then(|e| e.remedy.clone()).as_deref(),
            Some("Run: vercel link")
        );
    }

    #[test]
    fn blank_detail_is_dropped() {
        let error = ProviderError::new(ErrorCode::BuildFailed, "noop", "x").with_detail("  \n");
        assert!(error.detail.is_none());
    }

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::LintOrTypeCheckFailed).expect("serialize");
        assert_eq!(json, "\"LINT_OR_TYPE_CHECK_FAILED\"");
    }
}
