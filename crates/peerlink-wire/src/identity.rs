//! Connection identity: the canonical name of a logical link.

use crate::error::WireError;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Identifies a bidirectional link by both of its endpoints.
///
/// Two identities are equal iff all four fields match. The string form from
/// [`ConnectionIdentity::key`] parses back into an equal identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionIdentity {
    remote_host: String,
    remote_port: u16,
    local_host: String,
    local_port: u16,
}

impl ConnectionIdentity {
    pub fn new(
        remote_host: impl Into<String>,
        remote_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            local_host: local_host.into(),
            local_port,
        }
    }

    /// Identity of a connected socket pair.
    pub fn from_addrs(remote: SocketAddr, local: SocketAddr) -> Self {
        Self::new(
            remote.ip().to_string(),
            remote.port(),
            local.ip().to_string(),
            local.port(),
        )
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote endpoint as `host:port` (IPv6 hosts are bracketed).
    pub fn remote_address(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }

    /// Remote endpoint as a socket address, when the host is an IP literal.
    pub fn remote_socket_addr(&self) -> Option<SocketAddr> {
        self.remote_address().parse().ok()
    }

    /// Canonical registry key: `remote_host:remote_port/local_host:local_port`.
    pub fn key(&self) -> String {
        format!(
            "{}:{}/{}:{}",
            self.remote_host, self.remote_port, self.local_host, self.local_port
        )
    }
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn split_host_port(part: &str, whole: &str) -> Result<(String, u16), WireError> {
    let (host, port) = part
        .rsplit_once(':')
        .ok_or_else(|| WireError::MalformedFrame(format!("connection key without port: {whole}")))?;
    if host.is_empty() {
        return Err(WireError::MalformedFrame(format!(
            "connection key without host: {whole}"
        )));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| WireError::MalformedFrame(format!("invalid port in connection key: {whole}")))?;
    Ok((host.to_string(), port))
}

impl FromStr for ConnectionIdentity {
    type Err = WireError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let (remote, local) = key
            .split_once('/')
            .ok_or_else(|| WireError::MalformedFrame(format!("invalid connection key: {key}")))?;
        let (remote_host, remote_port) = split_host_port(remote, key)?;
        let (local_host, local_port) = split_host_port(local, key)?;
        Ok(Self {
            remote_host,
            remote_port,
            local_host,
            local_port,
        })
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
