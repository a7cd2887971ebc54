//! Client-side WebSocket protocol engine for already-upgraded streams.
//!
//! `wscore` implements the core of [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455)
//! on top of any `tokio` byte stream whose HTTP upgrade handshake has
//! already completed: frame encoding and decoding with masking, message
//! fragmentation, control-frame handling, streaming UTF-8 validation, the
//! close handshake and keep-alive pings.
//!
//! The engine is deliberately transport-agnostic. Connection establishment,
//! TLS and the upgrade request/response exchange are the caller's business;
//! the [`WebSocket`] is built from the resulting stream:
//!
//! ```no_run
//! use wscore::{MessageKind, Options, WebSocket};
//!
//! # async fn example(stream: tokio::net::TcpStream) -> wscore::Result<()> {
//! let ws = WebSocket::from_stream(stream, Options::default())?;
//!
//! ws.send(b"hello", MessageKind::Text, true).await?;
//!
//! let mut buf = [0u8; 4096];
//! let result = ws.receive(&mut buf).await?;
//! println!("{} bytes, end of message: {}", result.count, result.end_of_message);
//! # Ok(())
//! # }
//! ```
//!
//! One send and one receive may run concurrently from different tasks;
//! overlapping two sends or two receives is an API-misuse error. Caller
//! buffers may be smaller than a frame: the engine hands out payload in
//! pieces, preserving message boundaries through
//! [`ReceiveResult::end_of_message`].

pub mod close;
pub mod frame;
pub mod options;

mod buffer;
mod mask;
mod utf8;
mod websocket;

use thiserror::Error;

pub use close::{CloseCode, CloseInfo};
pub use frame::OpCode;
pub use options::{Options, Role};
pub use websocket::{MessageKind, ReceiveResult, WebSocket, WebSocketState};

/// A result type for WebSocket operations, using `WebSocketError` as the
/// error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors surfaced by WebSocket operations.
///
/// Broadly: local API misuse (wrong message kind, wrong state, overlapping
/// operations), protocol violations by the peer (malformed frames, invalid
/// UTF-8, bad close codes), transport failures, and lifecycle errors
/// (canceled by [`WebSocket::abort`], used after [`WebSocket::dispose`]).
///
/// Protocol violations on ingress trigger a best-effort Close frame with
/// status 1002 (or 1007 for invalid text payload) before the receive fails;
/// see [`WebSocketError::closes_with`].
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A send was attempted with [`MessageKind::Close`]; closing goes
    /// through [`WebSocket::close`] or [`WebSocket::close_output`].
    #[error("message type is not valid for send")]
    InvalidMessageType,

    /// The operation is not available in the connection's current state.
    #[error("{op} is not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: WebSocketState,
    },

    /// A second user send was started before the previous one completed.
    #[error("another send is already in progress")]
    SendInProgress,

    /// A second receive was started before the previous one completed.
    #[error("another receive is already in progress")]
    ReceiveInProgress,

    /// Reserved header bits were set. This engine negotiates no extensions,
    /// so RSV1-3 must be zero.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// The frame opcode is not one RFC 6455 defines.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A control frame arrived without the FIN bit; control frames must not
    /// be fragmented.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared a payload longer than 125 bytes.
    #[error("control frame payload too large")]
    ControlFrameTooLarge,

    /// A masked frame arrived from the server; servers must not mask.
    #[error("received masked frame from server")]
    MaskedServerFrame,

    /// An unmasked frame arrived from a client; clients must mask.
    #[error("received unmasked frame from client")]
    UnmaskedClientFrame,

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// A new Text or Binary frame arrived while a fragmented message was
    /// still in progress.
    #[error("expected a continuation frame")]
    ExpectedContinuation,

    /// A Close frame carried a one-byte payload; close payloads are either
    /// empty or at least a two-byte status code.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// A Close frame carried a status code that may not appear on the wire.
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    /// The reason bytes of a Close frame were not valid UTF-8.
    #[error("close reason is not valid UTF-8")]
    InvalidCloseReason,

    /// An outgoing close reason exceeded the 123 bytes that fit a control
    /// frame after the status code.
    #[error("close reason too long")]
    CloseReasonTooLong,

    /// A text message's payload was not valid UTF-8.
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    /// The stream ended in the middle of a frame or message.
    #[error("connection closed prematurely")]
    ConnectionClosedPrematurely,

    /// The operation was canceled by [`WebSocket::abort`].
    #[error("operation canceled")]
    Canceled,

    /// The connection was disposed.
    #[error("connection disposed")]
    Disposed,

    /// An externally supplied receive buffer was smaller than the 14 bytes
    /// a frame header may need.
    #[error("receive buffer of {0} bytes is too small (minimum 14)")]
    ReceiveBufferTooSmall(usize),

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// The close code the engine sends, best-effort, before failing a
    /// receive with this error. `None` for errors that are not ingress
    /// protocol violations (those abort without a close attempt).
    pub fn closes_with(&self) -> Option<CloseCode> {
        match self {
            Self::ReservedBitsNotZero
            | Self::InvalidOpCode(_)
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::MaskedServerFrame
            | Self::UnmaskedClientFrame
            | Self::UnexpectedContinuation
            | Self::ExpectedContinuation
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode(_)
            | Self::InvalidCloseReason => Some(CloseCode::Protocol),
            Self::InvalidUtf8 => Some(CloseCode::InvalidPayload),
            _ => None,
        }
    }
}
