use std::io;
use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

/// Represents errors that can occur during task execution in the worker pool.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by object pools.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The slot is not currently borrowed, so the object was recycled twice.
    #[error("object in slot {index} is already idle")]
    AlreadyIdle { index: usize },

    /// The lease refers to a slot this pool never handed out.
    #[error("slot {index} does not belong to this pool")]
    UnknownSlot { index: usize },

    #[error("pool lock poisoned")]
    LockPoisoned,
}

/// An expected, request-scoped outcome rendered as its HTTP status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct ResourceError {
    pub status: StatusCode,
    pub message: String,
}

impl ResourceError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "no route matches the request")
    }

    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "no handler for the request method",
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "authentication required")
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {} bytes", limit),
        )
    }

    pub fn service_unavailable() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "request processing timed out")
    }
}

/// Errors that surface while routing and executing a request.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Expected outcome carrying an HTTP status
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A phase ran past its deadline. Never leaves the phase machine.
    #[error("phase timed out after {0:?}")]
    Timeout(Duration),

    /// Failure raised by a controller, script or hook
    #[error("application failure: {0}")]
    Application(Box<dyn std::error::Error + Send + Sync>),

    /// Failure raised by the persistence unit
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Failure reading or binding request data
    #[error("binding failure: {0}")]
    Binding(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl RouterError {
    /// Wraps an arbitrary application error.
    pub fn application<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        RouterError::Application(err.into())
    }

    /// The HTTP status this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            RouterError::Resource(err) => err.status,
            RouterError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.status() == StatusCode::BAD_REQUEST
    }
}

/// Fatal errors detected while compiling the route table at startup.
#[derive(Debug, Error)]
pub enum RouteConfigError {
    #[error("unbalanced braces in uri template {template:?} at byte {position}")]
    UnbalancedBraces { template: String, position: usize },

    #[error("invalid pattern in uri template {template:?}: {source}")]
    InvalidPattern {
        template: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid access pattern {pattern:?}: {source}")]
    InvalidAccessPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("login page {0:?} cannot itself require authentication")]
    LoginPageRequiresAuthentication(String),

    #[error("duplicate route identifier {0:?}")]
    DuplicateRouteId(String),

    #[error("no argument resolver for parameter {param} of {route:?}")]
    UnresolvableParameter { route: String, param: String },

    #[error("route {id:?} takes {expected} arguments, {given} given")]
    ArgumentCount {
        id: String,
        expected: usize,
        given: usize,
    },

    #[error("unknown route identifier {0:?}")]
    UnknownRoute(String),
}

/// Type alias for Results using ExecutorError as the error type
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Type alias for Results using RouterError as the error type
pub type RouterResult<T> = std::result::Result<T, RouterError>;

/// Type alias for Results using PoolError as the error type
pub type PoolResult<T> = std::result::Result<T, PoolError>;
