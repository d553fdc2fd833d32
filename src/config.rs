//! Daemon endpoint discovery (spec §4.2, §6).
//!
//! Precedence: `PEERDRIVE` env var, then a per-user runtime file, then a
//! system-wide runtime file. Each file is a single UTF-8 line of the form
//! `tcp://HOST:PORT/COOKIE-HEX`.

use std::fmt;
use std::path::PathBuf;

/// The daemon's system-wide runtime file, used when no per-user file is found.
const SYSTEM_RUNTIME_FILE: &str = "/var/run/peerdrive/server.info";

/// Error discovering or parsing the daemon endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// None of `PEERDRIVE`, the per-user file, or the system file were usable.
    #[error("no peerdrive endpoint found (checked $PEERDRIVE, per-user and system runtime files)")]
    NotFound,
    /// A candidate file existed but its content could not be parsed.
    #[error("malformed endpoint descriptor {0:?}: expected tcp://HOST:PORT/COOKIE-HEX")]
    Malformed(String),
    /// The cookie component was not valid hex.
    #[error("invalid cookie hex in endpoint descriptor: {0}")]
    BadCookie(#[from] hex::FromHexError),
}

/// A resolved daemon endpoint: address to dial plus the handshake cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or IP to connect to.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Cookie bytes, relayed verbatim in the `Init` request.
    pub cookie: Vec<u8>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("cookie", &hex::encode(&self.cookie))
            .finish()
    }
}

impl Endpoint {
    /// Parse a `tcp://HOST:PORT/COOKIE-HEX` descriptor line.
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let line = line.trim();
        let rest = line
            .strip_prefix("tcp://")
            .ok_or_else(|| ConfigError::Malformed(line.to_string()))?;
        let (host_port, cookie_hex) = rest
            .split_once('/')
            .ok_or_else(|| ConfigError::Malformed(line.to_string()))?;
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Malformed(line.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::Malformed(line.to_string()))?;
        let cookie = hex::decode(cookie_hex)?;
        Ok(Endpoint { host: host.to_string(), port, cookie })
    }

    /// Discover the daemon endpoint following spec §4.2's precedence.
    ///
    /// Resolution order: `PEERDRIVE` env var (taken as the descriptor line
    /// itself), then `$XDG_RUNTIME_DIR/peerdrive-$USER/server.info`
    /// (falling back to `/tmp/peerdrive-$USER/server.info` when
    /// `XDG_RUNTIME_DIR` is unset, matching the original daemon-side
    /// convention — spec.md §9), then the system runtime file.
    pub fn discover() -> Result<Self, ConfigError> {
        if let Ok(line) = std::env::var("PEERDRIVE") {
            return Self::parse(&line);
        }
        if let Some(path) = per_user_runtime_file() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                return Self::parse(&contents);
            }
        }
        if let Ok(contents) = std::fs::read_to_string(SYSTEM_RUNTIME_FILE) {
            return Self::parse(&contents);
        }
        Err(ConfigError::NotFound)
    }
}

/// The per-user runtime file candidate path, or `None` if `USER` is unset
/// (spec.md §9: the client does not panic, it simply has no per-user
/// candidate to try).
fn per_user_runtime_file() -> Option<PathBuf> {
    let user = std::env::var("USER").ok()?;
    let base = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    Some(PathBuf::from(base).join(format!("peerdrive-{user}")).join("server.info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_descriptor() {
        let ep = Endpoint::parse("tcp://127.0.0.1:4234/aabbcc\n").unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 4234);
        assert_eq!(ep.cookie, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(Endpoint::parse("127.0.0.1:4234/aabbcc").is_err());
    }

    #[test]
    fn rejects_bad_cookie_hex() {
        assert!(Endpoint::parse("tcp://127.0.0.1:4234/zz").is_err());
    }

    #[test]
    fn rejects_bad_port() {
        assert!(Endpoint::parse("tcp://127.0.0.1:notaport/aabbcc").is_err());
    }
}
