use std::error::Error;
use std::fmt::{Display, Formatter};

pub type TesterResult<T> = Result<T, TesterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Success,
    InputValidationError,
    IoSystemError,
    EnvironmentError,
    InternalError,
    Interrupted,
}

impl ErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InputValidationError => 2,
            Self::IoSystemError => 3,
            Self::EnvironmentError => 4,
            Self::InternalError => 5,
            Self::Interrupted => 130,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::InputValidationError => "InputValidationError",
            Self::IoSystemError => "IoSystemError",
            Self::EnvironmentError => "EnvironmentError",
            Self::InternalError => "InternalError",
            Self::Interrupted => "Interrupted",
        }
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Fatal, invocation-level failure. Per-test problems never surface as a
/// `TesterError`; they become ERROR outcomes in the report instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TesterError {
    category: ErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl TesterError {
    pub fn new(category: ErrorCategory, placeholder: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn input_validation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InputValidationError, placeholder, message)
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::IoSystemError, placeholder, message)
    }

    pub fn environment(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::EnvironmentError, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InternalError, placeholder, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Interrupted, "RUN.INTERRUPTED", message)
    }

    pub const fn category(&self) -> ErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        let severity = if self.category.is_fatal() {
            "ERROR"
        } else {
            "INFO"
        };
        format!("{}: [{}] {}", severity, self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> Option<String> {
        self.category
            .is_fatal()
            .then(|| format!("FATAL EXIT CODE: {}", self.exit_code()))
    }
}

impl Display for TesterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for TesterError {}

#[cfg(test)]
mod tests {
    use super::{ErrorCategory, TesterError};

    #[test]
    fn exit_mapping_is_stable() {
        let cases = [
            (ErrorCategory::Success, 0, "Success"),
            (ErrorCategory::InputValidationError, 2, "InputValidationError"),
            (ErrorCategory::IoSystemError, 3, "IoSystemError"),
            (ErrorCategory::EnvironmentError, 4, "EnvironmentError"),
            (ErrorCategory::InternalError, 5, "InternalError"),
            (ErrorCategory::Interrupted, 130, "Interrupted"),
        ];

        for (category, exit_code, name) in cases {
            assert_eq!(category.exit_code(), exit_code);
            assert_eq!(category.as_str(), name);
        }
    }

    #[test]
    fn fatal_startup_codes_never_collide_with_test_failure_code() {
        for category in [
            ErrorCategory::InputValidationError,
            ErrorCategory::IoSystemError,
            ErrorCategory::EnvironmentError,
            ErrorCategory::InternalError,
            ErrorCategory::Interrupted,
        ] {
            assert_ne!(category.exit_code(), 0);
            assert_ne!(category.exit_code(), 1);
        }
    }

    #[test]
    fn fatal_error_renders_diagnostic_lines() {
        let error = TesterError::environment(
            "ENV.CORE_EXECUTABLE",
            "core executable 'yambo' was not found",
        );

        assert_eq!(error.exit_code(), 4);
        assert_eq!(
            error.diagnostic_line(),
            "ERROR: [ENV.CORE_EXECUTABLE] core executable 'yambo' was not found"
        );
        assert_eq!(
            error.fatal_exit_line().as_deref(),
            Some("FATAL EXIT CODE: 4")
        );
    }
}
