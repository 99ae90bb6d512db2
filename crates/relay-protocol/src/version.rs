//! Protocol and endpoint versioning for Relay.
//!
//! The socket protocol version travels as the `vsn` query parameter; the API
//! version is part of the endpoint path.

/// Current socket protocol version (`vsn=1.0.0`).
pub const PROTOCOL_VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Realtime API version used in the endpoint path.
pub const API_VERSION: u32 = 1;

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Build the websocket endpoint for a project base URL.
///
/// `http` maps to `ws` and `https` to `wss`; a URL without a scheme is
/// treated as `https`. Any path on the base URL is discarded.
#[must_use]
pub fn websocket_url(base_url: &str, api_key: &str) -> String {
    let (scheme, rest) = match base_url.split_once("://") {
        Some(("http", rest)) | Some(("ws", rest)) => ("ws", rest),
        Some((_, rest)) => ("wss", rest),
        None => ("wss", base_url),
    };
    let host = rest.split('/').next().unwrap_or(rest);
    format!(
        "{scheme}://{host}/realtime/v{API_VERSION}/websocket?apikey={api_key}&vsn={PROTOCOL_VERSION}"
    )
}
