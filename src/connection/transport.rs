use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DockerError, Result};

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";
const HTTP_SCHEME: &str = "http://";
const HTTPS_SCHEME: &str = "https://";

/// How to reach a Docker daemon. Addresses are kept in their normalised form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    UnixSocket {
        path: String,
    },
    Tcp {
        host: String,
        /// Directory holding `key.pem`, `cert.pem` and `ca.pem`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cert_path: Option<PathBuf>,
    },
}

impl Transport {
    /// `/var/run/docker.sock` becomes `unix:///var/run/docker.sock`.
    pub fn unix_socket(path: &str) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() || path == UNIX_SCHEME {
            return Err(DockerError::Config("empty unix socket path".to_string()));
        }
        let path = if path.starts_with(UNIX_SCHEME) {
            path.to_string()
        } else {
            format!("{}{}", UNIX_SCHEME, path)
        };
        Ok(Transport::UnixSocket { path })
    }

    /// Accepts `host:port`, `tcp://`, `http://` or `https://` addresses.
    /// A certificate directory switches the connection to TLS.
    pub fn tcp(host: &str, cert_path: Option<PathBuf>) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(DockerError::Config("empty tcp host".to_string()));
        }
        let mut host = if let Some(rest) = host.strip_prefix(TCP_SCHEME) {
            format!("{}{}", HTTP_SCHEME, rest)
        } else if host.contains("://") {
            host.to_string()
        } else {
            format!("{}{}", HTTP_SCHEME, host)
        };
        if cert_path.is_some() {
            if let Some(rest) = host.strip_prefix(HTTP_SCHEME) {
                host = format!("{}{}", HTTPS_SCHEME, rest);
            }
        }
        if !(host.starts_with(HTTP_SCHEME) || host.starts_with(HTTPS_SCHEME)) {
            return Err(DockerError::Config(format!("unsupported tcp address '{}'", host)));
        }
        Ok(Transport::Tcp { host, cert_path })
    }

    pub fn uri(&self) -> &str {
        match self {
            Transport::UnixSocket { path } => path,
            Transport::Tcp { host, .. } => host,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tcp { host, .. } if host.starts_with(HTTPS_SCHEME))
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}
