use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid address '{0}', expected compact IPv4 host:port")]
    InvalidAddress(String),

    #[error("peer {0} unreachable")]
    Unreachable(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("join via {addr} failed: {source}")]
    JoinFailed {
        addr: String,
        #[source]
        source: Box<Error>,
    },

    #[error("lookup exhausted after {0} hops")]
    LookupExhausted(u32),

    #[error("key '{0}' not found")]
    NotFound(String),

    #[error("peer does not support the requested method")]
    UnsupportedMethod,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
