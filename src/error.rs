//! Error taxonomy for the execution engine
//!
//! Every failure that crosses a component boundary is carried as an
//! [`ErrorX`]: a bounded chain of causes tagged with an [`ErrorClass`].
//! Downstream retry policies key off the class, so classification happens
//! at the source (transport, generator, cache) rather than at the top.

use std::fmt;
use std::sync::OnceLock;

use thiserror::Error;

/// Default bound on the cause chain kept inside an [`ErrorX`].
const DEFAULT_MAX_ERROR_DEPTH: usize = 3;

/// Cause message used when request iteration must stop because the template
/// still contains unresolved variables.
const UNRESOLVED_VARIABLES_MSG: &str = "stop execution due to unresolved variables";

/// Maximum depth of causes retained when wrapping or parsing errors.
/// Overridable through the `MAX_ERROR_DEPTH` environment variable.
pub fn max_error_depth() -> usize {
    static DEPTH: OnceLock<usize> = OnceLock::new();
    *DEPTH.get_or_init(|| {
        std::env::var("MAX_ERROR_DEPTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_ERROR_DEPTH)
    })
}

/// Classification tag attached to engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient network failures, resolvable by retrying with backoff
    /// (timeouts awaiting headers, connection reset by peer).
    NetworkTemporary,
    /// Permanent network failures needing manual intervention
    /// (no address found for host).
    NetworkPermanent,
    /// Engine-imposed deadline expired.
    Deadline,
    /// A template dependency was not met (missing extraction, unresolved
    /// variable). Safe to ignore for scan-failure accounting.
    TemplateLogic,
    /// Required input data was not provided.
    DataMissing,
    /// Anything unclassified.
    Unknown,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorClass::NetworkTemporary => "network-temporary-error",
            ErrorClass::NetworkPermanent => "network-permanent-error",
            ErrorClass::Deadline => "deadline-error",
            ErrorClass::TemplateLogic => "template-logic-error",
            ErrorClass::DataMissing => "data-missing",
            ErrorClass::Unknown => "unknown-class",
        };
        f.write_str(tag)
    }
}

/// Leaf error kinds produced inside the engine, converted into [`ErrorX`]
/// chains at component boundaries.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("DNS resolution failed: {0}")]
    Resolve(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// A typed, bounded chain of error causes with class tags.
///
/// Wrapping retains at most [`max_error_depth`] causes; additional causes
/// are discarded. When one `ErrorX` is merged into another, the receiver's
/// class stays first and wins for display, while every class is retained
/// comma-joined for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorX {
    classes: Vec<ErrorClass>,
    causes: Vec<String>,
}

impl ErrorX {
    /// Creates an unclassified error from a message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            classes: vec![ErrorClass::Unknown],
            causes: vec![msg.into()],
        }
    }

    /// Creates an error with an explicit class.
    pub fn with_class(class: ErrorClass, msg: impl Into<String>) -> Self {
        Self {
            classes: vec![class],
            causes: vec![msg.into()],
        }
    }

    /// Sentinel returned by the generator when iteration for the current
    /// target must stop because template variables stayed unresolved.
    pub fn unresolved_variables() -> Self {
        Self::with_class(ErrorClass::TemplateLogic, UNRESOLVED_VARIABLES_MSG)
    }

    /// True when this error is the unresolved-variables stop sentinel.
    pub fn is_unresolved_variables(&self) -> bool {
        self.causes
            .first()
            .is_some_and(|c| c == UNRESOLVED_VARIABLES_MSG)
    }

    /// Parses an arbitrary error into a chain, walking `source()` links up
    /// to the depth bound.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = current {
            if causes.len() >= max_error_depth() {
                break;
            }
            causes.push(e.to_string());
            current = e.source();
        }
        Self {
            classes: vec![ErrorClass::Unknown],
            causes,
        }
    }

    /// Appends a context message to the chain, respecting the depth bound.
    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        if self.causes.len() < max_error_depth() {
            self.causes.push(msg.into());
        }
        self
    }

    /// Sets the class of the error. A class set earlier stays first and is
    /// preferred for display.
    pub fn set_class(mut self, class: ErrorClass) -> Self {
        if self.classes == [ErrorClass::Unknown] {
            self.classes = vec![class];
        } else if !self.classes.contains(&class) {
            self.classes.push(class);
        }
        self
    }

    /// Merges another error into this one. The receiver's class wins for
    /// display; the merged error's classes and causes are retained after it.
    pub fn merge(&mut self, other: ErrorX) {
        for class in other.classes {
            if class != ErrorClass::Unknown && !self.classes.contains(&class) {
                self.classes.push(class);
            }
        }
        for cause in other.causes {
            if self.causes.len() >= max_error_depth() {
                break;
            }
            self.causes.push(cause);
        }
    }

    /// The class first set on this error, preferred for display.
    pub fn origin_class(&self) -> ErrorClass {
        self.classes.first().copied().unwrap_or(ErrorClass::Unknown)
    }

    /// All retained classes, comma-joined, for inspection.
    pub fn all_classes(&self) -> String {
        self.classes
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The original cause without any wrapping.
    pub fn cause(&self) -> Option<&str> {
        self.causes.first().map(String::as_str)
    }

    /// Number of causes retained in the chain.
    pub fn depth(&self) -> usize {
        self.causes.len()
    }

    /// True when the error belongs to the given class.
    pub fn is_class(&self, class: ErrorClass) -> bool {
        self.classes.contains(&class)
    }

    /// True for classes recorded against the host-errors cache.
    pub fn is_network_class(&self) -> bool {
        self.is_class(ErrorClass::NetworkTemporary)
            || self.is_class(ErrorClass::NetworkPermanent)
            || self.is_class(ErrorClass::Deadline)
    }

    /// Joins a list of errors into a single chain, preserving order.
    /// Returns `None` for an empty list.
    pub fn combine(errors: Vec<ErrorX>) -> Option<ErrorX> {
        let mut iter = errors.into_iter();
        let mut first = iter.next()?;
        for err in iter {
            first.merge(err);
        }
        Some(first)
    }
}

impl fmt::Display for ErrorX {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class={} {}", self.origin_class(), self.causes.join("; "))
    }
}

impl std::error::Error for ErrorX {}

impl From<EngineError> for ErrorX {
    fn from(err: EngineError) -> Self {
        let class = match &err {
            EngineError::Http(e) => classify_reqwest(e),
            EngineError::Url(_) => ErrorClass::TemplateLogic,
            EngineError::Tls(_) => ErrorClass::NetworkTemporary,
            EngineError::Io(e) => classify_io(e),
            EngineError::Json(_) => ErrorClass::Unknown,
            EngineError::Resolve(_) => ErrorClass::NetworkPermanent,
            EngineError::Config(_) => ErrorClass::DataMissing,
        };
        ErrorX::with_class(class, err.to_string())
    }
}

impl From<reqwest::Error> for ErrorX {
    fn from(err: reqwest::Error) -> Self {
        ErrorX::with_class(classify_reqwest(&err), err.to_string())
    }
}

impl From<url::ParseError> for ErrorX {
    fn from(err: url::ParseError) -> Self {
        ErrorX::with_class(ErrorClass::TemplateLogic, err.to_string())
    }
}

impl From<std::io::Error> for ErrorX {
    fn from(err: std::io::Error) -> Self {
        ErrorX::with_class(classify_io(&err), err.to_string())
    }
}

fn classify_reqwest(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        ErrorClass::Deadline
    } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        ErrorClass::NetworkTemporary
    } else {
        ErrorClass::Unknown
    }
}

fn classify_io(err: &std::io::Error) -> ErrorClass {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ErrorClass::Deadline,
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            ErrorClass::NetworkTemporary
        }
        ErrorKind::NotFound | ErrorKind::AddrNotAvailable => ErrorClass::NetworkPermanent,
        _ => ErrorClass::Unknown,
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ErrorX>;
