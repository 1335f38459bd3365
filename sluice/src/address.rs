//! Scheme-qualified address grammar.
//!
//! - `tcp://HOST:PORT` or bare `HOST:PORT` (scheme defaults to tcp);
//!   an empty host means 127.0.0.1.
//! - `uds://PATH` for unix-domain stream sockets.
//! - `pipe://NAME` for hosts without unix sockets (named streams).
//! - `shm://NAME` for the shared-memory bus; NAME is any non-empty
//!   string.

use std::fmt;
use std::path::PathBuf;

use sluice_types::{Result, Status};

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Uds { path: PathBuf },
    Pipe { name: String },
    Shm { name: String },
}

impl Address {
    /// Parse an address string. Unknown schemes are `NotSupported`;
    /// malformed addresses are `InvalidArgument`.
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            // Bare "host:port" is accepted as tcp for convenience.
            None => ("tcp", s),
        };

        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| Status::invalid_argument("tcp address must be host:port"))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| Status::invalid_argument(format!("invalid tcp port {port:?}")))?;
                let host = if host.is_empty() {
                    "127.0.0.1".to_string()
                } else {
                    host.to_string()
                };
                Ok(Address::Tcp { host, port })
            }
            "uds" => {
                if rest.is_empty() {
                    return Err(Status::invalid_argument("uds address must be a path"));
                }
                Ok(Address::Uds {
                    path: PathBuf::from(rest),
                })
            }
            "pipe" | "shm" => {
                if rest.is_empty() {
                    return Err(Status::invalid_argument(format!(
                        "{scheme} address must be a non-empty name"
                    )));
                }
                if scheme == "shm" {
                    Ok(Address::Shm {
                        name: rest.to_string(),
                    })
                } else {
                    Ok(Address::Pipe {
                        name: rest.to_string(),
                    })
                }
            }
            other => Err(Status::not_supported(format!("unknown scheme {other:?}"))),
        }
    }

    /// Canonical `tcp://` address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Address::Tcp {
            host: if host.is_empty() {
                "127.0.0.1".to_string()
            } else {
                host
            },
            port,
        }
    }

    /// Canonical `uds://` address.
    pub fn uds(path: impl Into<PathBuf>) -> Self {
        Address::Uds { path: path.into() }
    }

    /// Canonical `shm://` address.
    pub fn shm(name: impl Into<String>) -> Self {
        Address::Shm { name: name.into() }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Address::Uds { path } => write!(f, "uds://{}", path.display()),
            Address::Pipe { name } => write!(f, "pipe://{name}"),
            Address::Shm { name } => write!(f, "shm://{name}"),
        }
    }
}
