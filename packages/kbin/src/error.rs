//! Error type shared by every stage of the engine.
//!
//! Every failure carries a kind from the wire taxonomy, a message, and --
//! once the interpreter has annotated it -- the dotted schema path and the
//! byte offset at which it happened. Annotation is sticky: the innermost
//! frame wins, parents propagate unchanged.

use std::fmt::{self, Display, Formatter};


pub type Result<T> = std::result::Result<T, Error>;

/// Classification of engine failures, as exposed to the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Read or seek past end of stream.
    Eof,
    /// Underlying byte source failure (including zlib stream corruption).
    Io,
    /// A `contents` literal did not match the bytes read.
    ContentsMismatch,
    /// A `valid` constraint evaluated false.
    ValidationFailed,
    /// A numeric value does not fit its declared width, or a BCD nibble
    /// exceeds 9.
    RangeError,
    /// An operation was applied to a value of the wrong type.
    TypeMismatch,
    /// An expression referenced a name with no binding in scope.
    UnknownIdentifier,
    /// A type reference did not resolve in lexical scope.
    UnknownType,
    /// An enum reference did not resolve in lexical scope.
    UnknownEnum,
    /// A switch selector matched no case and no `_` default exists.
    SwitchNoMatch,
    /// An instance re-entered its own computation.
    InstanceCycle,
    /// An expression failed to lex or parse.
    CompileError,
    /// The serializer could not derive which switch case to write.
    AmbiguousCase,
    /// A configured work limit (element count, recursion depth) was hit.
    LimitExceeded,
    /// The cancellation token fired.
    Cancelled,
    /// Engine bug. Should never be observed.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Eof => "eof",
            ErrorKind::Io => "io",
            ErrorKind::ContentsMismatch => "contents_mismatch",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::RangeError => "range_error",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::UnknownIdentifier => "unknown_identifier",
            ErrorKind::UnknownType => "unknown_type",
            ErrorKind::UnknownEnum => "unknown_enum",
            ErrorKind::SwitchNoMatch => "switch_no_match",
            ErrorKind::InstanceCycle => "instance_cycle",
            ErrorKind::CompileError => "compile_error",
            ErrorKind::AmbiguousCase => "ambiguous_case",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    path: Option<String>,
    offset: Option<u64>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            path: None,
            offset: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Dotted schema path of the field that failed, eg `header.entries.3.sz`.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Byte offset in the stream being read or written, where meaningful.
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Attach the schema path, unless a deeper frame already did.
    pub(crate) fn at_path(mut self, path: &str) -> Self {
        if self.path.is_none() {
            self.path = Some(path.to_owned());
        }
        self
    }

    /// Attach the stream offset, unless a deeper frame already did.
    pub(crate) fn at_offset(mut self, offset: u64) -> Self {
        if self.offset.is_none() {
            self.offset = Some(offset);
        }
        self
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(ref path) = self.path {
            write!(f, " (at {})", path)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset {})", offset)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind =
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ErrorKind::Eof
            } else {
                ErrorKind::Io
            };
        Error::new(kind, e.to_string())
    }
}

macro_rules! error {
    ($kind:ident, $($t:tt)*)=>{
        $crate::error::Error::new(
            $crate::error::ErrorKind::$kind,
            format!($($t)*),
        )
    };
}

macro_rules! bail {
    ($kind:ident, $($t:tt)*)=>{
        return Err($crate::error::Error::new(
            $crate::error::ErrorKind::$kind,
            format!($($t)*),
        ))
    };
}

macro_rules! ensure {
    ($c:expr, $kind:ident, $($t:tt)*)=>{
        if !$c {
            return Err($crate::error::Error::new(
                $crate::error::ErrorKind::$kind,
                format!($($t)*),
            ));
        }
    };
}

pub(crate) use {bail, ensure, error};


#[test]
fn test_annotation_is_sticky() {
    let e = error!(Eof, "ran out")
        .at_path("a.b")
        .at_offset(7)
        .at_path("a")
        .at_offset(0);
    assert_eq!(e.path(), Some("a.b"));
    assert_eq!(e.offset(), Some(7));
    assert_eq!(e.kind(), ErrorKind::Eof);
}

#[test]
fn test_display() {
    let e = error!(ContentsMismatch, "want [1], got [2]").at_path("magic");
    assert_eq!(
        e.to_string(),
        "contents_mismatch: want [1], got [2] (at magic)",
    );
}
