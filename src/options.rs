//! Connection configuration.

use std::time::Duration;

/// The role this endpoint took in the upgrade handshake.
///
/// The client role masks every egress frame and rejects masked ingress
/// frames; the server role is the exact inverse.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Default receive buffer size, in bytes.
pub const DEFAULT_RECEIVE_BUFFER: usize = 4096;

/// Options consumed by [`WebSocket::from_stream`](crate::WebSocket::from_stream).
///
/// The stream handed to the engine has already completed its HTTP upgrade;
/// these options carry what the handshake agreed on plus local tuning.
#[derive(Default)]
pub struct Options {
    /// Role taken during the handshake. `None` defaults to [`Role::Client`].
    pub role: Option<Role>,

    /// Subprotocol agreed during the handshake, if any. Held for observation
    /// only; the engine attaches no semantics to it.
    pub subprotocol: Option<String>,

    /// Interval between unsolicited keep-alive Pings. `None` or zero
    /// disables the keep-alive timer.
    pub keep_alive_interval: Option<Duration>,

    /// Receive buffer size in bytes, raised to the maximum frame header
    /// size (14) if smaller. Ignored when `receive_buffer` is supplied.
    pub receive_buffer_size: Option<usize>,

    /// Externally supplied receive buffer, used exactly (whole length, no
    /// sub-range). Its length must be at least 14 or construction fails.
    pub receive_buffer: Option<Box<[u8]>>,
}

impl Options {
    /// Runs the connection in the server role: no egress masking, masked
    /// ingress required.
    pub fn with_server_role(self) -> Self {
        Self {
            role: Some(Role::Server),
            ..self
        }
    }

    /// Records the subprotocol agreed during the handshake.
    pub fn with_subprotocol(self, subprotocol: impl Into<String>) -> Self {
        Self {
            subprotocol: Some(subprotocol.into()),
            ..self
        }
    }

    /// Enables the keep-alive timer: an empty Ping is sent whenever the
    /// interval elapses and the send path is idle.
    pub fn with_keep_alive_interval(self, interval: Duration) -> Self {
        Self {
            keep_alive_interval: Some(interval),
            ..self
        }
    }

    /// Sets the size of the engine-owned receive buffer.
    pub fn with_receive_buffer_size(self, size: usize) -> Self {
        Self {
            receive_buffer_size: Some(size),
            ..self
        }
    }

    /// Supplies the receive buffer instead of letting the engine allocate
    /// one. The whole buffer is used and it is not returned.
    pub fn with_receive_buffer(self, buffer: impl Into<Box<[u8]>>) -> Self {
        Self {
            receive_buffer: Some(buffer.into()),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert!(opts.role.is_none());
        assert!(opts.subprotocol.is_none());
        assert!(opts.keep_alive_interval.is_none());
        assert!(opts.receive_buffer.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let opts = Options::default()
            .with_server_role()
            .with_subprotocol("graphql-ws")
            .with_keep_alive_interval(Duration::from_secs(30))
            .with_receive_buffer_size(8192);
        assert_eq!(opts.role, Some(Role::Server));
        assert_eq!(opts.subprotocol.as_deref(), Some("graphql-ws"));
        assert_eq!(opts.keep_alive_interval, Some(Duration::from_secs(30)));
        assert_eq!(opts.receive_buffer_size, Some(8192));
    }
}
