use thiserror::Error;

/// Errors raised by the WebDAV client layer
#[derive(Error, Debug)]
pub enum WebDavError {
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Authentication failed (401)")]
    Unauthorized,

    #[error("Access denied (403): {url}")]
    Forbidden { url: String },

    #[error("Resource not found: {url}")]
    NotFound { url: String },

    #[error("Method {method} not allowed on {url}")]
    MethodNotAllowed { method: String, url: String },

    #[error("Conflict (409) on {url}: missing intermediate collection?")]
    Conflict { url: String },

    #[error("Precondition failed (412) on {url}")]
    PreconditionFailed { url: String },

    #[error("Resource is locked (423): {url}")]
    Locked { url: String },

    #[error("Insufficient storage on server (507)")]
    InsufficientStorage,

    #[error("Server error {status} on {url}: {message}")]
    Server {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Unexpected status {status} on {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Malformed multistatus response: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No lock token in LOCK response for {url}")]
    MissingLockToken { url: String },
}

impl WebDavError {
    /// Maps a non-success HTTP status to a typed error. Callers match on
    /// the variant, so the mapping must stay stable.
    pub fn from_status(
        status: reqwest::StatusCode,
        method: &reqwest::Method,
        url: &str,
        body: String,
    ) -> Self {
        match status.as_u16() {
            400 => Self::BadRequest { message: body },
            401 => Self::Unauthorized,
            403 => Self::Forbidden { url: url.to_string() },
            404 | 410 => Self::NotFound { url: url.to_string() },
            405 => Self::MethodNotAllowed {
                method: method.to_string(),
                url: url.to_string(),
            },
            409 => Self::Conflict { url: url.to_string() },
            412 => Self::PreconditionFailed { url: url.to_string() },
            423 => Self::Locked { url: url.to_string() },
            507 => Self::InsufficientStorage,
            s if status.is_server_error() => Self::Server {
                status: s,
                url: url.to_string(),
                message: body,
            },
            s => Self::UnexpectedStatus {
                status: s,
                url: url.to_string(),
            },
        }
    }

    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Request(_))
    }
}

/// Errors raised by the synchronization engine
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    WebDav(#[from] WebDavError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("State database error: {0}")]
    State(#[from] sqlx::Error),

    #[error("Invalid exclusion pattern '{pattern}': {message}")]
    BadPattern { pattern: String, message: String },

    #[error("Local root is not a directory: {0}")]
    BadLocalRoot(String),

    #[error("Local path escapes the synchronized root: {0}")]
    PathOutsideRoot(String),
}

impl SyncError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
