use std::time::Duration;

use bytes::Bytes;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for Quarry protocol and client operations.
///
/// The retry/reconnect decisions made by the transaction and duplexing
/// layers are driven exclusively by [`Error::should_retry`] and
/// [`Error::should_reconnect`], never by matching on error text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad connection or configuration input. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A malformed frame, an unknown descriptor tag outside the annotation
    /// range, or any other violation of the wire contract. Fatal for the
    /// connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A positional descriptor reference that was not yet built, or a scalar
    /// type id with no registered codec. Fatal for the current parse.
    #[error("missing codec: {0}")]
    MissingCodec(String),

    /// A decoded error response from the server.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Socket-level failure. Generally requires a reconnect.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A message wait passed the configured timeout; the connection must be
    /// considered desynchronized.
    #[error("timed out after {0:?} waiting for a server message")]
    Timeout(Duration),

    /// Wraps the last underlying error once a transaction's retry budget is
    /// exhausted.
    #[error("transaction failed after {attempts} attempt(s)")]
    Transaction {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn should_retry(&self) -> bool {
        match self {
            Error::Server(e) => e.code.should_retry(),
            _ => false,
        }
    }

    pub fn should_reconnect(&self) -> bool {
        match self {
            Error::Server(e) => e.code.should_reconnect(),
            Error::Transport(_) | Error::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Protocol(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Protocol(value.to_string())
    }
}

/// Severity of a server error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error,
    Fatal,
    Panic,
}

impl TryFrom<u8> for ErrorSeverity {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x78 => Ok(ErrorSeverity::Error),
            0xC8 => Ok(ErrorSeverity::Fatal),
            0xFF => Ok(ErrorSeverity::Panic),
            other => Err(Error::Protocol(format!(
                "unknown error severity {other:#04x}"
            ))),
        }
    }
}

/// A server error code.
///
/// Codes form a hierarchy: trailing zero bytes of a category code are
/// wildcards, so `TRANSACTION_SERIALIZATION` is within
/// `TRANSACTION_CONFLICT`. Each code is independently annotated as
/// retryable and/or reconnect-required; those annotations drive the
/// transaction retry loop and the duplexer's reconnect decision.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(u32);

impl ErrorCode {
    pub const INTERNAL_SERVER_ERROR: Self = Self(0x0100_0000);
    pub const UNSUPPORTED_FEATURE: Self = Self(0x0200_0000);
    pub const PROTOCOL_ERROR: Self = Self(0x0300_0000);
    pub const BINARY_PROTOCOL_ERROR: Self = Self(0x0301_0000);
    pub const UNSUPPORTED_PROTOCOL_VERSION: Self = Self(0x0301_0001);
    pub const TYPE_SPEC_NOT_FOUND: Self = Self(0x0301_0002);
    pub const UNEXPECTED_MESSAGE: Self = Self(0x0301_0003);
    pub const INPUT_DATA_ERROR: Self = Self(0x0302_0000);
    pub const PARAMETER_TYPE_MISMATCH: Self = Self(0x0302_0100);
    pub const STATE_MISMATCH: Self = Self(0x0302_0200);
    pub const RESULT_CARDINALITY_MISMATCH: Self = Self(0x0303_0000);
    pub const CAPABILITY_ERROR: Self = Self(0x0304_0000);
    pub const UNSUPPORTED_CAPABILITY: Self = Self(0x0304_0100);
    pub const DISABLED_CAPABILITY: Self = Self(0x0304_0200);
    pub const QUERY_ERROR: Self = Self(0x0400_0000);
    pub const INVALID_SYNTAX: Self = Self(0x0401_0000);
    pub const QUERY_SYNTAX: Self = Self(0x0401_0100);
    pub const SCHEMA_SYNTAX: Self = Self(0x0401_0200);
    pub const INVALID_TYPE: Self = Self(0x0402_0000);
    pub const INVALID_REFERENCE: Self = Self(0x0403_0000);
    pub const UNKNOWN_MODULE: Self = Self(0x0403_0001);
    pub const UNKNOWN_PARAMETER: Self = Self(0x0403_0006);
    pub const SCHEMA_ERROR: Self = Self(0x0404_0000);
    pub const SCHEMA_DEFINITION_ERROR: Self = Self(0x0405_0000);
    pub const SESSION_TIMEOUT: Self = Self(0x0406_0000);
    pub const IDLE_SESSION_TIMEOUT: Self = Self(0x0406_0100);
    pub const QUERY_TIMEOUT: Self = Self(0x0406_0200);
    pub const TRANSACTION_TIMEOUT: Self = Self(0x0406_0A00);
    pub const IDLE_TRANSACTION_TIMEOUT: Self = Self(0x0406_0A01);
    pub const EXECUTION_ERROR: Self = Self(0x0500_0000);
    pub const INVALID_VALUE: Self = Self(0x0501_0000);
    pub const DIVISION_BY_ZERO: Self = Self(0x0501_0001);
    pub const NUMERIC_OUT_OF_RANGE: Self = Self(0x0501_0002);
    pub const ACCESS_POLICY_ERROR: Self = Self(0x0501_0003);
    pub const INTEGRITY_ERROR: Self = Self(0x0502_0000);
    pub const CONSTRAINT_VIOLATION: Self = Self(0x0502_0001);
    pub const CARDINALITY_VIOLATION: Self = Self(0x0502_0002);
    pub const MISSING_REQUIRED: Self = Self(0x0502_0003);
    pub const TRANSACTION_ERROR: Self = Self(0x0503_0000);
    pub const TRANSACTION_CONFLICT: Self = Self(0x0503_0100);
    pub const TRANSACTION_SERIALIZATION: Self = Self(0x0503_0101);
    pub const TRANSACTION_DEADLOCK: Self = Self(0x0503_0102);
    pub const CONFIGURATION_ERROR: Self = Self(0x0600_0000);
    pub const ACCESS_ERROR: Self = Self(0x0700_0000);
    pub const AUTHENTICATION_ERROR: Self = Self(0x0701_0000);
    pub const AVAILABILITY_ERROR: Self = Self(0x0800_0000);
    pub const BACKEND_UNAVAILABLE: Self = Self(0x0800_0001);
    pub const BACKEND_ERROR: Self = Self(0x0900_0000);
    pub const LOG_MESSAGE: Self = Self(0xF000_0000);
    pub const WARNING_MESSAGE: Self = Self(0xF001_0000);

    /// Whether a statement failing with this code may be re-attempted
    /// within a transaction's retry budget.
    pub fn should_retry(self) -> bool {
        self.is_within(Self::TRANSACTION_CONFLICT)
            || matches!(
                self,
                Self::STATE_MISMATCH | Self::IDLE_SESSION_TIMEOUT | Self::BACKEND_UNAVAILABLE
            )
    }

    /// Whether the connection should be re-established before retrying.
    pub fn should_reconnect(self) -> bool {
        matches!(
            self,
            Self::IDLE_SESSION_TIMEOUT | Self::IDLE_TRANSACTION_TIMEOUT
        )
    }

    /// Hierarchical category test: trailing zero bytes of `category` act as
    /// wildcards.
    pub fn is_within(self, category: ErrorCode) -> bool {
        let mut mask: u32 = 0xFFFF_FFFF;
        let mut code = category.0;
        while code != 0 && code & 0xFF == 0 {
            mask <<= 8;
            code >>= 8;
        }
        self.0 & mask == category.0
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::INTERNAL_SERVER_ERROR => "InternalServerError",
            Self::UNSUPPORTED_FEATURE => "UnsupportedFeatureError",
            Self::PROTOCOL_ERROR => "ProtocolError",
            Self::BINARY_PROTOCOL_ERROR => "BinaryProtocolError",
            Self::UNSUPPORTED_PROTOCOL_VERSION => "UnsupportedProtocolVersionError",
            Self::TYPE_SPEC_NOT_FOUND => "TypeSpecNotFoundError",
            Self::UNEXPECTED_MESSAGE => "UnexpectedMessageError",
            Self::INPUT_DATA_ERROR => "InputDataError",
            Self::PARAMETER_TYPE_MISMATCH => "ParameterTypeMismatchError",
            Self::STATE_MISMATCH => "StateMismatchError",
            Self::RESULT_CARDINALITY_MISMATCH => "ResultCardinalityMismatchError",
            Self::CAPABILITY_ERROR => "CapabilityError",
            Self::UNSUPPORTED_CAPABILITY => "UnsupportedCapabilityError",
            Self::DISABLED_CAPABILITY => "DisabledCapabilityError",
            Self::QUERY_ERROR => "QueryError",
            Self::INVALID_SYNTAX => "InvalidSyntaxError",
            Self::QUERY_SYNTAX => "QuerySyntaxError",
            Self::SCHEMA_SYNTAX => "SchemaSyntaxError",
            Self::INVALID_TYPE => "InvalidTypeError",
            Self::INVALID_REFERENCE => "InvalidReferenceError",
            Self::UNKNOWN_MODULE => "UnknownModuleError",
            Self::UNKNOWN_PARAMETER => "UnknownParameterError",
            Self::SCHEMA_ERROR => "SchemaError",
            Self::SCHEMA_DEFINITION_ERROR => "SchemaDefinitionError",
            Self::SESSION_TIMEOUT => "SessionTimeoutError",
            Self::IDLE_SESSION_TIMEOUT => "IdleSessionTimeoutError",
            Self::QUERY_TIMEOUT => "QueryTimeoutError",
            Self::TRANSACTION_TIMEOUT => "TransactionTimeoutError",
            Self::IDLE_TRANSACTION_TIMEOUT => "IdleTransactionTimeoutError",
            Self::EXECUTION_ERROR => "ExecutionError",
            Self::INVALID_VALUE => "InvalidValueError",
            Self::DIVISION_BY_ZERO => "DivisionByZeroError",
            Self::NUMERIC_OUT_OF_RANGE => "NumericOutOfRangeError",
            Self::ACCESS_POLICY_ERROR => "AccessPolicyError",
            Self::INTEGRITY_ERROR => "IntegrityError",
            Self::CONSTRAINT_VIOLATION => "ConstraintViolationError",
            Self::CARDINALITY_VIOLATION => "CardinalityViolationError",
            Self::MISSING_REQUIRED => "MissingRequiredError",
            Self::TRANSACTION_ERROR => "TransactionError",
            Self::TRANSACTION_CONFLICT => "TransactionConflictError",
            Self::TRANSACTION_SERIALIZATION => "TransactionSerializationError",
            Self::TRANSACTION_DEADLOCK => "TransactionDeadlockError",
            Self::CONFIGURATION_ERROR => "ConfigurationError",
            Self::ACCESS_ERROR => "AccessError",
            Self::AUTHENTICATION_ERROR => "AuthenticationError",
            Self::AVAILABILITY_ERROR => "AvailabilityError",
            Self::BACKEND_UNAVAILABLE => "BackendUnavailableError",
            Self::BACKEND_ERROR => "BackendError",
            Self::LOG_MESSAGE => "LogMessage",
            Self::WARNING_MESSAGE => "WarningMessage",
            _ => "UnknownError",
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ErrorCode> for u32 {
    fn from(value: ErrorCode) -> Self {
        value.0
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ErrorCode({}, {:#010x})", self.name(), self.0)
    }
}

// Attribute codes carried in an error response.
const ATTR_HINT: u16 = 0x0001;
const ATTR_DETAILS: u16 = 0x0002;
const ATTR_SERVER_TRACEBACK: u16 = 0x0101;
const ATTR_LINE_START: u16 = 0xFFF3;
const ATTR_COLUMN_START: u16 = 0xFFF5;
const ATTR_LINE_END: u16 = 0xFFF6;
const ATTR_COLUMN_END: u16 = 0xFFF8;

/// A decoded server error response.
///
/// When the originating query text is attached with
/// [`ServerError::with_query`], `Display` renders a caret-annotated excerpt
/// pointing at the offending line/column span; otherwise it falls back to
/// `"<code>: <message>"`.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub severity: ErrorSeverity,
    pub code: ErrorCode,
    pub message: String,
    attributes: Vec<(u16, Bytes)>,
    query: Option<String>,
}

impl ServerError {
    pub fn new(
        severity: ErrorSeverity,
        code: ErrorCode,
        message: String,
        attributes: Vec<(u16, Bytes)>,
    ) -> Self {
        ServerError {
            severity,
            code,
            message,
            attributes,
            query: None,
        }
    }

    /// Attaches the query text that produced this error, enabling the
    /// caret-annotated rendering.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    fn attribute(&self, code: u16) -> Option<&Bytes> {
        self.attributes
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v)
    }

    fn attribute_str(&self, code: u16) -> Option<std::borrow::Cow<'_, str>> {
        self.attribute(code).map(|b| String::from_utf8_lossy(b))
    }

    fn attribute_usize(&self, code: u16) -> Option<usize> {
        self.attribute_str(code)?.trim().parse().ok()
    }

    pub fn hint(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.attribute_str(ATTR_HINT)
    }

    pub fn details(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.attribute_str(ATTR_DETAILS)
    }

    pub fn server_traceback(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.attribute_str(ATTR_SERVER_TRACEBACK)
    }

    /// The 1-based (line, column) span of the offending query fragment, if
    /// the server reported one.
    pub fn query_span(&self) -> Option<((usize, usize), (usize, usize))> {
        Some((
            (
                self.attribute_usize(ATTR_LINE_START)?,
                self.attribute_usize(ATTR_COLUMN_START)?,
            ),
            (
                self.attribute_usize(ATTR_LINE_END)?,
                self.attribute_usize(ATTR_COLUMN_END)?,
            ),
        ))
    }

    fn prettify(&self) -> Option<String> {
        let query = self.query.as_deref()?;
        let ((line_start, col_start), (line_end, col_end)) = self.query_span()?;
        let lines: Vec<&str> = query.lines().collect();
        if line_start == 0 || col_start == 0 || line_end > lines.len() || line_end < line_start {
            return None;
        }

        let width = line_end.to_string().len();
        let mut out = format!("{}: {}\n", self.code, self.message);
        out.push_str(&format!("{:>width$} |\n", ""));

        for no in line_start..=line_end {
            let line = lines[no - 1];
            out.push_str(&format!("{no:>width$} | {line}\n"));

            let from = if no == line_start { col_start } else { 1 };
            let to = if no == line_end {
                col_end
            } else {
                line.chars().count() + 1
            };
            let pad = from - 1;
            let carets = "^".repeat(to.saturating_sub(from).max(1));
            out.push_str(&format!("{:>width$} | {:pad$}{carets}\n", "", ""));
        }

        if let Some(hint) = self.hint() {
            out.push_str(&format!("Hint: {hint}"));
        }

        Some(out.trim_end_matches('\n').to_string())
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.prettify() {
            Some(pretty) => f.write_str(&pretty),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_hierarchy() {
        assert!(ErrorCode::TRANSACTION_SERIALIZATION.is_within(ErrorCode::TRANSACTION_CONFLICT));
        assert!(ErrorCode::TRANSACTION_DEADLOCK.is_within(ErrorCode::TRANSACTION_CONFLICT));
        assert!(ErrorCode::TRANSACTION_CONFLICT.is_within(ErrorCode::TRANSACTION_ERROR));
        assert!(!ErrorCode::CONSTRAINT_VIOLATION.is_within(ErrorCode::TRANSACTION_CONFLICT));
        assert!(ErrorCode::QUERY_SYNTAX.is_within(ErrorCode::QUERY_ERROR));
    }

    #[test]
    fn test_retry_annotations() {
        assert!(ErrorCode::TRANSACTION_CONFLICT.should_retry());
        assert!(ErrorCode::TRANSACTION_SERIALIZATION.should_retry());
        assert!(ErrorCode::STATE_MISMATCH.should_retry());
        assert!(!ErrorCode::CONSTRAINT_VIOLATION.should_retry());
        assert!(!ErrorCode::QUERY_SYNTAX.should_retry());

        assert!(ErrorCode::IDLE_SESSION_TIMEOUT.should_reconnect());
        assert!(!ErrorCode::TRANSACTION_CONFLICT.should_reconnect());
    }

    #[test]
    fn test_plain_rendering() {
        let err = ServerError::new(
            ErrorSeverity::Error,
            ErrorCode::QUERY_SYNTAX,
            "unexpected token".into(),
            vec![],
        );
        assert_eq!(err.to_string(), "QuerySyntaxError: unexpected token");
    }

    #[test]
    fn test_caret_rendering() {
        let attrs = vec![
            (ATTR_LINE_START, Bytes::from_static(b"1")),
            (ATTR_LINE_END, Bytes::from_static(b"1")),
            (ATTR_COLUMN_START, Bytes::from_static(b"8")),
            (ATTR_COLUMN_END, Bytes::from_static(b"11")),
            (ATTR_HINT, Bytes::from_static(b"did you mean `Item`?")),
        ];
        let err = ServerError::new(
            ErrorSeverity::Error,
            ErrorCode::INVALID_REFERENCE,
            "object type 'Itm' does not exist".into(),
            attrs,
        )
        .with_query("select Itm { name }");

        let rendered = err.to_string();
        assert!(rendered.contains("1 | select Itm { name }"));
        assert!(rendered.contains("^^^"));
        assert!(rendered.contains("Hint: did you mean `Item`?"));
    }
}
