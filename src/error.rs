//! Error types for pg-nano.

use std::panic::Location;

use thiserror::Error;

/// Result type for pg-nano operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Position in internal query
    pub internal_position: Option<u32>,
    /// Failed internal command text
    pub internal_query: Option<String>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized form.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// A fatal error reported by the server for one command.
///
/// The connection survives this error; only the query that produced it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Fields of the ErrorResponse message.
    pub fields: ErrorFields,
    /// The SQL command that failed, when it could be recovered.
    pub command: Option<String>,
}

impl ServerError {
    /// Create a server error without command text.
    pub fn new(fields: ErrorFields) -> Self {
        Self {
            fields,
            command: None,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fields)?;
        if let Some(command) = &self.command {
            write!(f, "\nCOMMAND: {}", command)?;
        }
        Ok(())
    }
}

/// Error type for pg-nano.
#[derive(Debug, Error)]
pub enum Error {
    /// Pool or connection lifecycle misuse, exhaustion, or closed-while-in-use.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server closed the socket.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// The database reported a fatal error for one command.
    #[error("PostgreSQL error: {0}")]
    Server(Box<ServerError>),

    /// Row or column count expectation violated.
    #[error("Query contract violated: {0}")]
    Contract(String),

    /// A value could not be rendered as a text literal.
    #[error("Cannot encode value: {0}")]
    Encode(String),

    /// A text value could not be decoded.
    #[error("Cannot decode value: {0}")]
    Decode(String),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The caller's cancellation signal fired.
    #[error("Query aborted")]
    Aborted,

    /// An error annotated with the call site that created the failing query.
    #[error("{source}\n    at {location}")]
    AtCallSite {
        /// Where the query was constructed.
        location: &'static Location<'static>,
        /// The original error.
        source: Box<Error>,
    },
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_) => true,
            Error::Server(err) => {
                // FATAL and PANIC errors indicate connection is broken
                matches!(err.fields.severity(), Some("FATAL") | Some("PANIC"))
            }
            Error::AtCallSite { source, .. } => source.is_connection_broken(),
            _ => false,
        }
    }

    /// Returns true for errors that must never be retried.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::Encode(_) | Error::Auth(_) | Error::Unsupported(_) => true,
            Error::AtCallSite { source, .. } => source.is_terminal(),
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(err) => err.fields.code.as_deref(),
            Error::AtCallSite { source, .. } => source.sqlstate(),
            _ => None,
        }
    }

    /// Get the failing command text if this is a server error.
    pub fn command(&self) -> Option<&str> {
        match self {
            Error::Server(err) => err.command.as_deref(),
            Error::AtCallSite { source, .. } => source.command(),
            _ => None,
        }
    }

    /// Strip any call-site annotation.
    pub fn root(&self) -> &Error {
        match self {
            Error::AtCallSite { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn server(fields: ErrorFields) -> Self {
        Error::Server(Box::new(ServerError::new(fields)))
    }

    pub(crate) fn with_command(self, command: &str) -> Self {
        match self {
            Error::Server(mut err) if err.command.is_none() => {
                err.command = Some(command.to_string());
                Error::Server(err)
            }
            other => other,
        }
    }

    pub(crate) fn at(self, location: &'static Location<'static>) -> Self {
        match self {
            already @ Error::AtCallSite { .. } => already,
            source => Error::AtCallSite {
                location,
                source: Box::new(source),
            },
        }
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}
