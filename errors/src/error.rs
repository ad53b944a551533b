use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Schedule,
    Dispatch,
    Queue,
    Cache,
    Orm,
    Token,
    Proxy,
    Upstream,
    Generator,
    RateLimit,
    Service,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Schedule => write!(f, "schedule"),
            ErrorKind::Dispatch => write!(f, "dispatch"),
            ErrorKind::Queue => write!(f, "queue"),
            ErrorKind::Cache => write!(f, "cache"),
            ErrorKind::Orm => write!(f, "orm"),
            ErrorKind::Token => write!(f, "token"),
            ErrorKind::Proxy => write!(f, "proxy"),
            ErrorKind::Upstream => write!(f, "upstream"),
            ErrorKind::Generator => write!(f, "generator"),
            ErrorKind::RateLimit => write!(f, "rate limit"),
            ErrorKind::Service => write!(f, "service"),
            ErrorKind::Config => write!(f, "config"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: String, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Queue)
    }

    pub fn is_orm(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Orm)
    }

    pub fn is_token(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Token)
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Upstream)
    }

    /// A row that does not exist, as opposed to a store that is unwell.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.inner
                .source
                .as_deref()
                .and_then(|s| s.downcast_ref::<OrmError>()),
            Some(OrmError::NotFound)
        )
    }

    fn source_text(&self) -> String {
        let mut text = String::new();
        if let Some(ref message) = self.inner.message {
            text.push_str(message);
        }
        if let Some(ref source) = self.inner.source {
            text.push(' ');
            text.push_str(&source.to_string());
        }
        text
    }

    /// The upstream signals exhausted quota inside the error body, not the
    /// status line, so classification is by substring.
    pub fn is_quota_exceeded(&self) -> bool {
        let text = self.source_text();
        text.contains("quotaExceeded") || text.contains("dailyLimitExceeded")
    }

    pub fn is_duplicate(&self) -> bool {
        if matches!(
            self.inner
                .source
                .as_deref()
                .and_then(|s| s.downcast_ref::<UpstreamError>()),
            Some(UpstreamError::DuplicateContent)
        ) {
            return true;
        }
        let text = self.source_text().to_lowercase();
        text.contains("duplicate") || text.contains("processingfailure")
    }

    pub fn is_proxy(&self) -> bool {
        if matches!(self.inner.kind, ErrorKind::Proxy) {
            return true;
        }
        let text = self.source_text().to_lowercase();
        text.contains("proxy")
    }

    pub fn is_timeout(&self) -> bool {
        if let Some(source) = &self.inner.source {
            source.to_string().to_lowercase().contains("timeout")
        } else {
            false
        }
    }

    pub fn is_connect(&self) -> bool {
        if let Some(source) = &self.inner.source {
            let msg = source.to_string().to_lowercase();
            msg.contains("connect") || msg.contains("connection")
        } else {
            false
        }
    }

    /// Transient errors go back to the queue with backoff; terminal ones are
    /// classified once and recorded on the comment row.
    pub fn is_transient(&self) -> bool {
        if self.is_quota_exceeded() || self.is_duplicate() || self.is_token() {
            return false;
        }
        self.is_timeout()
            || self.is_connect()
            || matches!(
                self.inner.kind,
                ErrorKind::Queue | ErrorKind::Cache | ErrorKind::Orm
            )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("chorus::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<ScheduleError> for Error {
    fn from(err: ScheduleError) -> Self {
        Error::new(ErrorKind::Schedule, Some(err))
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Error::new(ErrorKind::Queue, Some(err))
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::new(ErrorKind::Cache, Some(err))
    }
}

impl From<OrmError> for Error {
    fn from(err: OrmError) -> Self {
        Error::new(ErrorKind::Orm, Some(err))
    }
}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        Error::new(ErrorKind::Token, Some(err))
    }
}

impl From<ProxyError> for Error {
    fn from(err: ProxyError) -> Self {
        Error::new(ErrorKind::Proxy, Some(err))
    }
}

impl From<UpstreamError> for Error {
    fn from(err: UpstreamError) -> Self {
        Error::new(ErrorKind::Upstream, Some(err))
    }
}

impl From<GeneratorError> for Error {
    fn from(err: GeneratorError) -> Self {
        Error::new(ErrorKind::Generator, Some(err))
    }
}

impl From<ServiceError> for Error {
    fn from(err: ServiceError) -> Self {
        Error::new(ErrorKind::Service, Some(err))
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule not found")]
    NotFound,
    #[error("schedule is not active")]
    NotActive,
    #[error("no target videos configured")]
    NoTargets,
    #[error("no comment templates configured")]
    NoTemplates,
    #[error("no eligible accounts")]
    NoAccounts,
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("serialization failed")]
    SerializationFailed(#[source] BoxError),
    #[error("deserialization failed")]
    DeserializationFailed(#[source] BoxError),
    #[error("connection failed")]
    ConnectionFailed,
    #[error("push to queue failed")]
    PushFailed(#[source] BoxError),
    #[error("duplicate job id: {0}")]
    DuplicateJob(String),
    #[error("queue operation failed: {0}")]
    OperationFailed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[source] BoxError),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("serde error: {0}")]
    Serde(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum OrmError {
    #[error("database connection error: {0}")]
    ConnectionError(#[source] BoxError),
    #[error("query execution error: {0}")]
    QueryExecutionError(#[source] BoxError),
    #[error("transaction error: {0}")]
    TransactionError(#[source] BoxError),
    #[error("data not found")]
    NotFound,
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("account has no refresh token")]
    MissingRefreshToken,
    #[error("refresh rejected by provider: {0}")]
    RefreshRejected(String),
    #[error("refresh request failed: {0}")]
    RefreshFailed(#[source] BoxError),
    #[error("no api profile bound to account")]
    MissingProfile,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no proxy assigned")]
    NotAssigned,
    #[error("proxy failed or invalid")]
    ProbeFailed,
    #[error("invalid proxy url: {0}")]
    InvalidUrl(String),
    #[error("transport build failed: {0}")]
    TransportBuild(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    RequestFailed(#[source] BoxError),
    #[error("invalid status {status}: {body}")]
    InvalidStatus { status: u16, body: String },
    #[error("quotaExceeded")]
    QuotaExceeded,
    #[error("comment rejected as duplicate")]
    DuplicateContent,
    #[error("empty response")]
    EmptyResponse,
    #[error("video not found: {0}")]
    VideoNotFound(String),
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("no templates available")]
    NoTemplates,
    #[error("metadata lookup failed: {0}")]
    MetadataFailed(#[source] BoxError),
    #[error("llm call failed: {0}")]
    LlmFailed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("internal error")]
    InternalError,
    #[error("shutdown in progress")]
    ShuttingDown,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Service, Some(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(
            ErrorKind::Queue,
            Some(QueueError::SerializationFailed(err.into())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::from(ScheduleError::NotFound);
        assert_eq!(err.to_string(), "schedule error: schedule not found");
    }

    #[test]
    fn test_quota_classification() {
        let err = Error::from(UpstreamError::InvalidStatus {
            status: 403,
            body: "quotaExceeded: the request cannot be completed".into(),
        });
        assert!(err.is_quota_exceeded());
        assert!(!err.is_transient());

        let err = Error::from(UpstreamError::QuotaExceeded);
        assert!(err.is_quota_exceeded());
    }

    #[test]
    fn test_duplicate_classification() {
        let err = Error::from(UpstreamError::DuplicateContent);
        assert!(err.is_duplicate());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_proxy_classification() {
        let err = Error::from(ProxyError::ProbeFailed);
        assert!(err.is_proxy());

        let err = Error::from(UpstreamError::RequestFailed(
            "Proxy failed or invalid".to_string().into(),
        ));
        assert!(err.is_proxy());
    }

    #[test]
    fn test_transient_classification() {
        let err = Error::from(UpstreamError::RequestFailed(
            "connection timeout after 10s".to_string().into(),
        ));
        assert!(err.is_timeout());
        assert!(err.is_transient());

        let err = Error::from(TokenError::RefreshRejected("invalid_grant".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = Error::from(io_err);
        assert!(StdError::source(&err).is_some());
    }
}
