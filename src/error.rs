use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Categorized driver failure, derived from the SQLSTATE class when the
/// driver reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // 42601 = syntax_error, everything else in 42 is a bad reference
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                ErrorCategory::Semantic
            }
        }
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Failure reported by a database driver or connection pool.
#[derive(Debug, Error)]
#[error("{category}: {message}")]
pub struct DriverError {
    pub category: ErrorCategory,
    /// SQLSTATE code when the database supplied one.
    pub code: Option<String>,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl DriverError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_code(code: &str, message: impl Into<String>) -> Self {
        Self {
            category: categorize_sqlstate(code),
            code: Some(code.to_string()),
            message: message.into(),
            source: None,
        }
    }
}

impl From<tokio_postgres::Error> for DriverError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code().to_string();
            let mut message = db_err.message().to_string();
            if let Some(detail) = db_err.detail() {
                message.push_str(&format!(" ({})", detail));
            }
            Self {
                category: categorize_sqlstate(&code),
                code: Some(code),
                message,
                source: Some(Box::new(err)),
            }
        } else {
            let category = if err.source().is_some() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            Self {
                category,
                code: None,
                message: err.to_string(),
                source: Some(Box::new(err)),
            }
        }
    }
}

impl From<deadpool_postgres::PoolError> for DriverError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self {
            category: ErrorCategory::Connection,
            code: None,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("statement `{0}` not found")]
    ConfigNotFound(String),
    #[error("malformed statement: {0}")]
    ConfigParse(String),
    #[error("dialect `{dialect}` unsupported: {reason}")]
    DialectUnsupported { dialect: String, reason: String },
    #[error("sharding route failed: {0}")]
    ShardingRoute(String),
    #[error("parameter binding failed: {0}")]
    ParameterBinding(String),
    #[error("execution failed: {0}")]
    Execution(#[source] DriverError),
    #[error("result mapping failed: {0}")]
    ResultMapping(String),
    #[error("batch aborted after {completed_chunks} completed chunk(s), {affected} row(s) affected: {source}")]
    Batch {
        completed_chunks: usize,
        affected: u64,
        #[source]
        source: Box<EngineError>,
    },
}

/// Where a failure happened, so misconfiguration can be located from the
/// message alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub statement: Option<String>,
    pub dialect: Option<String>,
    pub caller: Option<String>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "statement={}, dialect={}, caller={}",
            self.statement.as_deref().unwrap_or("-"),
            self.dialect.as_deref().unwrap_or("-"),
            self.caller.as_deref().unwrap_or("unknown")
        )
    }
}

#[derive(Debug, Error)]
#[error("{kind} [{context}]")]
pub struct EngineError {
    #[source]
    pub kind: ErrorKind,
    pub context: ErrorContext,
}

impl EngineError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: ErrorContext::default(),
        }
    }

    pub fn config_not_found(id: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigNotFound(id.into()))
    }

    pub fn config_parse(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigParse(msg.into()))
    }

    pub fn dialect_unsupported(dialect: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::DialectUnsupported {
            dialect: dialect.into(),
            reason: reason.into(),
        })
    }

    pub fn sharding(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ShardingRoute(msg.into()))
    }

    pub fn binding(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParameterBinding(msg.into()))
    }

    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResultMapping(msg.into()))
    }

    pub fn execution(err: impl Into<DriverError>) -> Self {
        Self::new(ErrorKind::Execution(err.into()))
    }

    /// Fill context fields that are still unset. Inner layers that already
    /// know more (e.g. a child statement of a cascade) keep their values.
    pub fn with_context(mut self, context: &ErrorContext) -> Self {
        if self.context.statement.is_none() {
            self.context.statement = context.statement.clone();
        }
        if self.context.dialect.is_none() {
            self.context.dialect = context.dialect.clone();
        }
        if self.context.caller.is_none() {
            self.context.caller = context.caller.clone();
        }
        self
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConfigNotFound(_)
                | ErrorKind::ConfigParse(_)
                | ErrorKind::DialectUnsupported { .. }
        )
    }
}

impl From<DriverError> for EngineError {
    fn from(err: DriverError) -> Self {
        EngineError::execution(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("23505"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("25001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("XX000"), ErrorCategory::Unknown);
        assert_eq!(categorize_sqlstate("4"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_error_message_carries_context() {
        let err = EngineError::config_not_found("qStaff").with_context(&ErrorContext {
            statement: Some("qStaff".into()),
            dialect: Some("postgresql".into()),
            caller: Some("app::staff::list".into()),
        });
        let msg = err.to_string();
        assert!(msg.contains("statement `qStaff` not found"));
        assert!(msg.contains("dialect=postgresql"));
        assert!(msg.contains("caller=app::staff::list"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_with_context_keeps_inner_values() {
        let inner = EngineError::binding("null key").with_context(&ErrorContext {
            statement: Some("child_delete".into()),
            ..Default::default()
        });
        let outer = inner.with_context(&ErrorContext {
            statement: Some("root".into()),
            dialect: Some("mysql".into()),
            caller: None,
        });
        assert_eq!(outer.context.statement.as_deref(), Some("child_delete"));
        assert_eq!(outer.context.dialect.as_deref(), Some("mysql"));
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::with_code("23505", "duplicate key");
        assert_eq!(err.category, ErrorCategory::Execution);
        assert_eq!(err.to_string(), "Execution Error: duplicate key");
    }
}
