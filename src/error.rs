use std::io;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("SIP parse error: {message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("registration refused with status {0}")]
    Registration(u16),
    #[error("unknown domain: {0}")]
    UnknownDomain(String),
    #[error("no such user: {0}")]
    NoSuchUser(String),
}

impl RegistryError {
    pub fn status_code(&self) -> u16 {
        match self {
            RegistryError::Registration(code) => *code,
            RegistryError::UnknownDomain(_) | RegistryError::NoSuchUser(_) => 404,
        }
    }
}

/// Errors raised while handling one inbound request
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("SIP {code}: {reason}")]
    Sip { code: u16, reason: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn sip(code: u16, reason: impl Into<String>) -> Self {
        ProxyError::Sip {
            code,
            reason: reason.into(),
        }
    }

    /// Status code to answer the request with, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProxyError::Sip { code, .. } => Some(*code),
            ProxyError::Parse(_) => Some(400),
            ProxyError::Registry(e) => Some(e.status_code()),
            // The socket is what failed, answering would fail too
            ProxyError::Io(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("harness error: {0}")]
    Harness(String),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
