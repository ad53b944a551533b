pub mod error;

pub use error::{
    BoxError, CacheError, Error, ErrorKind, GeneratorError, OrmError, ProxyError, QueueError,
    Result, ScheduleError, ServiceError, TokenError, UpstreamError,
};
