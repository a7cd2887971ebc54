//! The protocol engine.
//!
//! [`WebSocket`] drives RFC 6455 message I/O on a stream whose HTTP upgrade
//! has already completed. It owns the stream exclusively: the read half
//! feeds the receive engine, the write half is shared between user sends,
//! control-frame responses and keep-alive pings under the send mutex.
//!
//! ## Concurrency contract
//!
//! Exactly one send and one receive may be in progress at a time, from
//! different tasks ([`WebSocket`] methods take `&self`; wrap it in an `Arc`
//! to share). A second concurrent send or receive is API misuse and fails
//! fast. [`WebSocket::close`] may overlap a pending receive: it waits for
//! the in-flight receive rather than starting its own.
//!
//! ## Buffering
//!
//! The caller's receive buffer may be smaller than a frame. The engine
//! persists the partially-consumed frame header (and, in the server role,
//! the rolling mask offset) between calls, so a message is handed out in as
//! many pieces as the caller's buffer requires, with
//! [`ReceiveResult::end_of_message`] marking the last piece.

use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc, OnceLock,
};
use std::time::Duration;

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::ReceiveBuffer,
    close::{CloseCode, CloseInfo},
    frame::{FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE},
    mask::apply_mask,
    options::{Options, Role, DEFAULT_RECEIVE_BUFFER},
    utf8::Utf8Validator,
    Result, WebSocketError,
};

/// Scratch size for the close handshake's internal receives: one maximal
/// control frame.
const CLOSE_SCRATCH: usize = MAX_CONTROL_PAYLOAD + MAX_HEADER_SIZE;

/// Observable connection state.
///
/// `CloseSent` and `CloseReceived` record whichever side of the close
/// handshake was observed first; once both Close frames have passed (or
/// after abort/dispose) the state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WebSocketState {
    /// Handshake still in progress. Never observed on a constructed engine;
    /// `from_stream` enters `Open` directly.
    Connecting = 1,
    /// Both directions usable.
    Open = 2,
    /// We sent a Close frame and may still receive.
    CloseSent = 3,
    /// The peer sent a Close frame and may still accept sends.
    CloseReceived = 4,
    /// Close handshake complete, or disposed.
    Closed = 5,
    /// Unilaterally terminated.
    Aborted = 6,
}

impl WebSocketState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::CloseSent,
            4 => Self::CloseReceived,
            6 => Self::Aborted,
            _ => Self::Closed,
        }
    }
}

/// The kind of message a [`ReceiveResult`] delivered, or the kind passed to
/// [`WebSocket::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text. Validated incrementally on receive.
    Text,
    /// Opaque bytes.
    Binary,
    /// The peer's Close frame. Never valid for [`WebSocket::send`].
    Close,
}

/// Outcome of one [`WebSocket::receive`] call.
#[derive(Debug)]
pub struct ReceiveResult {
    /// Bytes written into the caller's buffer.
    pub count: usize,
    /// What the bytes are part of.
    pub kind: MessageKind,
    /// `true` iff this call consumed the last payload byte of a final
    /// frame, i.e. the message is complete.
    pub end_of_message: bool,
    /// Close code, for `kind == Close`.
    pub close_code: Option<CloseCode>,
    /// Close reason, for `kind == Close`.
    pub close_reason: Option<String>,
}

// ================ shared state ====================

/// Lock-free connection state.
///
/// The two close flags are recorded independently; the visible state is
/// derived from them. Nothing here is ever held across an await, and the
/// close coordinator's mutex never nests with any lock: the close path only
/// touches atomics.
struct Shared {
    state: AtomicU8,
    sent_close: AtomicBool,
    received_close: AtomicBool,
    disposed: AtomicBool,
    close_info: OnceLock<CloseInfo>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WebSocketState::Open as u8),
            sent_close: AtomicBool::new(false),
            received_close: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            close_info: OnceLock::new(),
        }
    }

    fn state(&self) -> WebSocketState {
        WebSocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn on_close_sent(&self) {
        self.sent_close.store(true, Ordering::Release);
        self.apply_close_flags();
    }

    fn on_close_received(&self, info: CloseInfo) {
        let _ = self.close_info.set(info);
        self.received_close.store(true, Ordering::Release);
        self.apply_close_flags();
    }

    /// Re-derives the visible state from the close flags. Terminal states
    /// are never downgraded.
    fn apply_close_flags(&self) {
        let sent = self.sent_close.load(Ordering::Acquire);
        let received = self.received_close.load(Ordering::Acquire);
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if WebSocketState::from_u8(cur) >= WebSocketState::Closed {
                    return None;
                }
                let next = match (sent, received) {
                    (true, true) => WebSocketState::Closed,
                    (true, false) => WebSocketState::CloseSent,
                    (false, true) => WebSocketState::CloseReceived,
                    (false, false) => return None,
                };
                Some(next as u8)
            });
    }

    /// Forces `Aborted` unless the close handshake already completed.
    fn set_aborted(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if WebSocketState::from_u8(cur) == WebSocketState::Closed {
                    None
                } else {
                    Some(WebSocketState::Aborted as u8)
                }
            });
    }

    /// Forces `Closed` unless already terminal.
    fn set_closed(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if WebSocketState::from_u8(cur) >= WebSocketState::Closed {
                    None
                } else {
                    Some(WebSocketState::Closed as u8)
                }
            });
    }
}

// ================ receive engine ====================

struct Receiver<S> {
    stream: ReadHalf<S>,
    buf: ReceiveBuffer,
    role: Role,
    /// Header of the current frame, persisted while `remaining > 0` spans
    /// receive calls.
    header: Option<FrameHeader>,
    /// Opcode of the in-progress fragmented message; `None` at message
    /// boundaries. Tracked separately from the persisted header so the
    /// original opcode stream still drives continuity checks.
    message_opcode: Option<OpCode>,
    utf8: Utf8Validator,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> Receiver<S> {
    /// One step of the receive loop: delivers data-frame payload into
    /// `out`, transparently answering Ping, swallowing Pong and ingesting
    /// Close along the way.
    async fn next(&mut self, inner: &Inner<S>, out: &mut [u8]) -> Result<ReceiveResult> {
        loop {
            // Once the peer's Close frame was ingested, every subsequent
            // receive reports it again.
            if inner.shared.received_close.load(Ordering::Acquire) {
                return Ok(inner.close_result());
            }

            let mut header = match self.header.take() {
                Some(header) => header,
                None => {
                    // A clean EOF is tolerated only between messages; the
                    // caller still observes it as a closed transport.
                    let at_boundary = self.message_opcode.is_none();
                    if !self
                        .buf
                        .ensure_at_least(&mut self.stream, 2, at_boundary)
                        .await?
                    {
                        inner.shared.set_aborted();
                        return Err(WebSocketError::ConnectionClosedPrematurely);
                    }
                    let need = FrameHeader::size_from_second_byte(self.buf.available()[1]);
                    self.buf.ensure_at_least(&mut self.stream, need, false).await?;
                    let (header, used) =
                        FrameHeader::parse(&self.buf.available()[..need], self.role)?;
                    self.buf.consume(used);

                    if header.opcode.is_control() {
                        match self.control_frame(inner, header).await? {
                            Some(result) => return Ok(result),
                            None => continue,
                        }
                    }

                    match (header.opcode, self.message_opcode) {
                        (OpCode::Continuation, None) => {
                            return Err(WebSocketError::UnexpectedContinuation)
                        }
                        (OpCode::Continuation, Some(_)) => {}
                        (_, Some(_)) => return Err(WebSocketError::ExpectedContinuation),
                        (opcode, None) => {
                            self.message_opcode = Some(opcode);
                            if opcode == OpCode::Text {
                                self.utf8.reset();
                            }
                        }
                    }
                    header
                }
            };

            let kind = match self.message_opcode {
                Some(OpCode::Text) => MessageKind::Text,
                _ => MessageKind::Binary,
            };

            let mut copied = 0;
            if header.remaining > 0 {
                if self.buf.count() == 0 {
                    self.buf.ensure_at_least(&mut self.stream, 1, false).await?;
                }
                let to_copy = (header.remaining.min(out.len() as u64) as usize)
                    .min(self.buf.count());
                if let Some(mask) = header.mask {
                    header.mask_offset =
                        apply_mask(&mut self.buf.available_mut()[..to_copy], mask, header.mask_offset);
                }
                out[..to_copy].copy_from_slice(&self.buf.available()[..to_copy]);
                self.buf.consume(to_copy);
                header.remaining -= to_copy as u64;
                copied = to_copy;
            }

            let end_of_message = header.fin && header.remaining == 0;

            if kind == MessageKind::Text {
                if !self.utf8.consume(&out[..copied]) {
                    return Err(WebSocketError::InvalidUtf8);
                }
                if end_of_message && !self.utf8.finish() {
                    return Err(WebSocketError::InvalidUtf8);
                }
            }

            if header.remaining == 0 {
                if header.fin {
                    self.message_opcode = None;
                }
            } else {
                self.header = Some(header);
            }

            return Ok(ReceiveResult {
                count: copied,
                kind,
                end_of_message,
                close_code: None,
                close_reason: None,
            });
        }
    }

    /// Consumes a control frame's payload and dispatches it. Returns a
    /// result only for Close; Ping and Pong loop back into the driver.
    async fn control_frame(
        &mut self,
        inner: &Inner<S>,
        header: FrameHeader,
    ) -> Result<Option<ReceiveResult>> {
        let len = header.remaining as usize;
        let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
        let mut filled = 0;
        while filled < len {
            if self.buf.count() == 0 {
                self.buf.ensure_at_least(&mut self.stream, 1, false).await?;
            }
            let take = (len - filled).min(self.buf.count());
            payload[filled..filled + take].copy_from_slice(&self.buf.available()[..take]);
            self.buf.consume(take);
            filled += take;
        }
        if let Some(mask) = header.mask {
            apply_mask(&mut payload[..len], mask, 0);
        }
        let payload = &payload[..len];

        match header.opcode {
            OpCode::Ping => {
                // Exactly one Pong per Ping, echoing the payload.
                inner.send_control(OpCode::Pong, payload).await?;
                Ok(None)
            }
            OpCode::Pong => Ok(None),
            OpCode::Close => Ok(Some(inner.ingest_close(payload)?)),
            _ => unreachable!("data opcode dispatched as control"),
        }
    }
}

// ================ send engine ====================

struct Sender<S> {
    stream: WriteHalf<S>,
    role: Role,
    /// Reusable serialization buffer. Holds at most one frame; cleared on
    /// every exit path of `send_frame`.
    buf: BytesMut,
    /// The previous user send had `end_of_message == false`, so the next
    /// one continues that message.
    last_send_fragmented: bool,
    #[cfg(test)]
    mask_override: Option<[u8; 4]>,
}

impl<S: AsyncWrite + Unpin> Sender<S> {
    /// Serializes and writes one frame: header, then the payload masked in
    /// the send buffer (the caller's slice is never mutated), as a single
    /// stream write.
    async fn send_frame(&mut self, opcode: OpCode, fin: bool, payload: &[u8]) -> Result<()> {
        let mask = match self.role {
            Role::Client => Some(self.fresh_mask()),
            Role::Server => None,
        };
        let header = FrameHeader {
            fin,
            opcode,
            remaining: payload.len() as u64,
            mask,
            mask_offset: 0,
        };
        let mut head = [0u8; MAX_HEADER_SIZE];
        let head_len = header.encode(&mut head);

        self.buf.clear();
        self.buf.reserve(head_len + payload.len());
        self.buf.extend_from_slice(&head[..head_len]);
        self.buf.extend_from_slice(payload);
        if let Some(mask) = mask {
            apply_mask(&mut self.buf[head_len..], mask, 0);
        }

        let result = async {
            self.stream.write_all(&self.buf).await?;
            self.stream.flush().await
        }
        .await;
        self.buf.clear();
        result.map_err(WebSocketError::from)
    }

    fn fresh_mask(&self) -> [u8; 4] {
        #[cfg(test)]
        if let Some(mask) = self.mask_override {
            return mask;
        }
        rand::random()
    }
}

// ================ the engine ====================

struct Inner<S> {
    shared: Shared,
    recv: Mutex<Receiver<S>>,
    send: Mutex<Sender<S>>,
    /// Serializes close-handshake receives started by `close` against each
    /// other; user receives are serialized by `recv` itself.
    close_coord: Mutex<()>,
    abort: CancellationToken,
    /// A user send is in flight. Distinguishes API misuse from the send
    /// mutex contention that internal control frames cause.
    send_claimed: AtomicBool,
    keepalive: std::sync::Mutex<Option<JoinHandle<()>>>,
    subprotocol: Option<String>,
}

/// Clears the user-send claim when the send completes or is dropped.
struct SendClaim<'a>(&'a AtomicBool);

impl Drop for SendClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S> Inner<S> {
    fn check_disposed(&self) -> Result<()> {
        if self.shared.disposed.load(Ordering::Acquire) {
            Err(WebSocketError::Disposed)
        } else {
            Ok(())
        }
    }

    fn check_state(&self, op: &'static str, allowed: &[WebSocketState]) -> Result<()> {
        let state = self.shared.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(WebSocketError::InvalidState { op, state })
        }
    }

    fn close_result(&self) -> ReceiveResult {
        let info = self.shared.close_info.get();
        ReceiveResult {
            count: 0,
            kind: MessageKind::Close,
            end_of_message: true,
            close_code: info.map(|i| i.code),
            close_reason: info.map(|i| i.reason.clone()),
        }
    }

    /// Records the peer's Close frame. Any malformation fails before the
    /// received-close flag is set, so the protocol-error close path still
    /// runs.
    fn ingest_close(&self, payload: &[u8]) -> Result<ReceiveResult> {
        let info = match payload.len() {
            0 => CloseInfo {
                code: CloseCode::Normal,
                reason: String::new(),
            },
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !CloseCode::from(code).is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode(code));
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WebSocketError::InvalidCloseReason)?;
                CloseInfo {
                    code: CloseCode::from(code),
                    reason: reason.to_owned(),
                }
            }
        };

        log::debug!(
            "close frame received: code={:?} reason={:?}",
            info.code,
            info.reason
        );
        self.shared.on_close_received(info);
        Ok(self.close_result())
    }

    fn abort_connection(&self) {
        self.shared.set_aborted();
        self.abort.cancel();
        self.stop_keepalive();
    }

    fn stop_keepalive(&self) {
        if let Ok(mut guard) = self.keepalive.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> Inner<S> {
    /// Sends an engine-originated control frame (Pong, keep-alive Ping).
    /// Contends on the send mutex like any other frame.
    async fn send_control(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut sender = self.send.lock().await;
        sender.send_frame(opcode, true, payload).await
    }

    /// Sends a Close frame and records it. Used by `close_output`, `close`
    /// and the best-effort close after an ingress protocol error.
    async fn send_close_frame(&self, code: CloseCode, reason: &str) -> Result<()> {
        if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
            return Err(WebSocketError::CloseReasonTooLong);
        }
        let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
        payload[..2].copy_from_slice(&u16::from(code).to_be_bytes());
        payload[2..2 + reason.len()].copy_from_slice(reason.as_bytes());
        let len = 2 + reason.len();

        let result = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(WebSocketError::Canceled),
            r = async {
                let mut sender = self.send.lock().await;
                sender.send_frame(OpCode::Close, true, &payload[..len]).await
            } => r,
        };

        match result {
            Ok(()) => {
                self.shared.on_close_sent();
                Ok(())
            }
            Err(err) => {
                self.abort_connection();
                Err(err)
            }
        }
    }

    /// Runs one receive step under an already-acquired receive lock, racing
    /// the abort signal, and applies the failure policy: protocol
    /// violations get a best-effort Close, transport failures abort.
    async fn receive_step(
        &self,
        recv: &mut Receiver<S>,
        out: &mut [u8],
    ) -> Result<ReceiveResult> {
        let result = tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(WebSocketError::Canceled),
            r = recv.next(self, out) => r,
        };

        if let Err(err) = &result {
            if let Some(code) = err.closes_with() {
                log::debug!("protocol error on receive ({err}), closing with {:?}", code);
                if !self.shared.sent_close.load(Ordering::Acquire)
                    && matches!(
                        self.shared.state(),
                        WebSocketState::Open | WebSocketState::CloseReceived
                    )
                {
                    // Best effort: the receive fails with the original
                    // error regardless.
                    let _ = self.send_close_frame(code, "").await;
                }
            } else if matches!(
                err,
                WebSocketError::Io(_) | WebSocketError::ConnectionClosedPrematurely
            ) {
                self.abort_connection();
            }
        }

        result
    }
}

// ================ keep-alive ====================

/// Periodic unsolicited Ping while the send path is idle. A tick that finds
/// the send mutex busy is skipped: the in-flight frame already proves
/// liveness.
fn spawn_keepalive<S>(inner: &Arc<Inner<S>>, interval: Duration) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = inner.abort.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if inner.shared.state() >= WebSocketState::Closed {
                break;
            }
            let Ok(mut sender) = inner.send.try_lock() else {
                continue;
            };
            if let Err(err) = sender.send_frame(OpCode::Ping, true, &[]).await {
                // Observed by the next user operation; keep-alive never
                // fails the connection on its own.
                log::debug!("keep-alive ping failed: {err}");
            }
        }
    })
}

// ================ public type ====================

/// A WebSocket connection over an already-upgraded stream.
///
/// Created with [`from_stream`](WebSocket::from_stream) from any
/// `AsyncRead + AsyncWrite` transport once the HTTP upgrade has completed.
/// The connection starts in [`WebSocketState::Open`].
///
/// Methods take `&self`: share the value behind an `Arc` to run one send
/// and one receive concurrently. Dropping the `WebSocket` disposes it.
pub struct WebSocket<S> {
    inner: Arc<Inner<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> WebSocket<S> {
    /// Builds the engine around a connected, upgraded stream.
    ///
    /// Fails only if `options` supplied an external receive buffer smaller
    /// than the 14 bytes a frame header may occupy.
    ///
    /// A keep-alive interval in `options` spawns the ping task onto the
    /// current tokio runtime.
    pub fn from_stream(stream: S, options: Options) -> Result<Self> {
        let role = options.role.unwrap_or(Role::Client);
        let buf = match options.receive_buffer {
            Some(external) => {
                if external.len() < MAX_HEADER_SIZE {
                    return Err(WebSocketError::ReceiveBufferTooSmall(external.len()));
                }
                ReceiveBuffer::from_external(external)
            }
            None => ReceiveBuffer::new(
                options.receive_buffer_size.unwrap_or(DEFAULT_RECEIVE_BUFFER),
            ),
        };

        let (read, write) = tokio::io::split(stream);
        let inner = Arc::new(Inner {
            shared: Shared::new(),
            recv: Mutex::new(Receiver {
                stream: read,
                buf,
                role,
                header: None,
                message_opcode: None,
                utf8: Utf8Validator::new(),
            }),
            send: Mutex::new(Sender {
                stream: write,
                role,
                buf: BytesMut::new(),
                last_send_fragmented: false,
                #[cfg(test)]
                mask_override: None,
            }),
            close_coord: Mutex::new(()),
            abort: CancellationToken::new(),
            send_claimed: AtomicBool::new(false),
            keepalive: std::sync::Mutex::new(None),
            subprotocol: options.subprotocol,
        });

        if let Some(interval) = options.keep_alive_interval.filter(|d| !d.is_zero()) {
            let handle = spawn_keepalive(&inner, interval);
            if let Ok(mut guard) = inner.keepalive.lock() {
                *guard = Some(handle);
            }
        }

        Ok(Self { inner })
    }

    /// Sends one frame of a message.
    ///
    /// `end_of_message == false` starts or continues a fragmented message;
    /// until a final frame is sent, subsequent sends are issued as
    /// continuation frames no matter which data `kind` they pass. The
    /// payload slice is never mutated: client-role masking happens in the
    /// engine's send buffer.
    ///
    /// Valid in `Open` and `CloseReceived`. A second send before the first
    /// completes fails with [`WebSocketError::SendInProgress`].
    pub async fn send(&self, payload: &[u8], kind: MessageKind, end_of_message: bool) -> Result<()> {
        let inner = &self.inner;
        inner.check_disposed()?;
        if kind == MessageKind::Close {
            return Err(WebSocketError::InvalidMessageType);
        }
        inner.check_state("send", &[WebSocketState::Open, WebSocketState::CloseReceived])?;

        if inner.send_claimed.swap(true, Ordering::AcqRel) {
            return Err(WebSocketError::SendInProgress);
        }
        let _claim = SendClaim(&inner.send_claimed);

        let result = tokio::select! {
            biased;
            _ = inner.abort.cancelled() => Err(WebSocketError::Canceled),
            r = async {
                let mut sender = inner.send.lock().await;
                let opcode = if sender.last_send_fragmented {
                    OpCode::Continuation
                } else if kind == MessageKind::Text {
                    OpCode::Text
                } else {
                    OpCode::Binary
                };
                sender.last_send_fragmented = !end_of_message;
                sender.send_frame(opcode, end_of_message, payload).await
            } => r,
        };

        if let Err(err) = &result {
            if matches!(err, WebSocketError::Io(_)) {
                // A frame may be partially on the wire; nothing after it
                // can be framed correctly.
                inner.abort_connection();
            }
        }
        result
    }

    /// Receives the next piece of a message into `buf`.
    ///
    /// Ping frames are answered and Pong frames consumed internally; the
    /// call keeps reading until data-frame payload (or the peer's Close)
    /// is available. `buf` smaller than the frame simply yields the frame
    /// over multiple calls; an empty `buf` returns `count == 0` and the
    /// boundary flags of the pending frame.
    ///
    /// Valid in `Open` and `CloseSent`. A second receive before the first
    /// completes fails with [`WebSocketError::ReceiveInProgress`].
    pub async fn receive(&self, buf: &mut [u8]) -> Result<ReceiveResult> {
        let inner = &self.inner;
        inner.check_disposed()?;
        inner.check_state("receive", &[WebSocketState::Open, WebSocketState::CloseSent])?;

        let mut recv = inner
            .recv
            .try_lock()
            .map_err(|_| WebSocketError::ReceiveInProgress)?;
        inner.receive_step(&mut recv, buf).await
    }

    /// Sends a Close frame without waiting for the peer's, moving the state
    /// to `CloseSent` (or `Closed` if the peer's Close was already seen).
    ///
    /// The reason must fit the 123 bytes a control frame leaves after the
    /// status code. Valid in `Open` and `CloseReceived`.
    pub async fn close_output(&self, code: CloseCode, reason: &str) -> Result<()> {
        let inner = &self.inner;
        inner.check_disposed()?;
        inner.check_state(
            "close_output",
            &[WebSocketState::Open, WebSocketState::CloseReceived],
        )?;
        inner.send_close_frame(code, reason).await
    }

    /// Runs the full close handshake: sends a Close frame (unless one was
    /// already sent) and drains incoming frames until the peer's Close
    /// arrives, then settles in `Closed`.
    ///
    /// Concurrent with a pending receive, this waits for that receive to
    /// observe the peer's Close instead of starting its own. Calling it
    /// again after the handshake completed is a no-op.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let inner = &self.inner;
        inner.check_disposed()?;
        if inner.shared.state() == WebSocketState::Closed {
            return Ok(());
        }
        inner.check_state(
            "close",
            &[
                WebSocketState::Open,
                WebSocketState::CloseReceived,
                WebSocketState::CloseSent,
            ],
        )?;

        if !inner.shared.sent_close.load(Ordering::Acquire) {
            inner.send_close_frame(code, reason).await?;
        }

        let _coord = tokio::select! {
            biased;
            _ = inner.abort.cancelled() => return Err(WebSocketError::Canceled),
            guard = inner.close_coord.lock() => guard,
        };

        while !inner.shared.received_close.load(Ordering::Acquire) {
            let mut recv = tokio::select! {
                biased;
                _ = inner.abort.cancelled() => return Err(WebSocketError::Canceled),
                guard = inner.recv.lock() => guard,
            };
            // The receive that just released the lock may have ingested the
            // peer's Close already.
            if inner.shared.received_close.load(Ordering::Acquire) {
                break;
            }
            let mut scratch = [0u8; CLOSE_SCRATCH];
            let result = inner.receive_step(&mut recv, &mut scratch).await?;
            if result.kind == MessageKind::Close {
                break;
            }
        }

        inner.shared.set_closed();
        inner.stop_keepalive();
        log::debug!("close handshake complete");

        // Best-effort transport shutdown; the peer may already be gone.
        if let Ok(mut sender) = inner.send.try_lock() {
            let _ = sender.stream.shutdown().await;
        }

        Ok(())
    }

    /// Unilaterally terminates the connection: all pending and future
    /// operations fail with [`WebSocketError::Canceled`] and the state
    /// becomes `Aborted` (unless the handshake had already completed).
    /// Idempotent.
    pub fn abort(&self) {
        self.inner.abort_connection();
    }

    /// Releases the connection's resources. Pending operations are
    /// unblocked as by [`abort`](WebSocket::abort); operations started
    /// after disposal fail with [`WebSocketError::Disposed`]. Idempotent;
    /// dropping the `WebSocket` disposes it.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if !inner.shared.disposed.swap(true, Ordering::AcqRel) {
            inner.shared.set_closed();
            inner.abort.cancel();
            inner.stop_keepalive();
        }
    }

    /// Current connection state.
    pub fn state(&self) -> WebSocketState {
        self.inner.shared.state()
    }

    /// Close code observed from the peer (or synthesized), once the close
    /// handshake has progressed that far.
    pub fn close_code(&self) -> Option<CloseCode> {
        self.inner.shared.close_info.get().map(|i| i.code)
    }

    /// Close reason accompanying [`close_code`](WebSocket::close_code).
    pub fn close_reason(&self) -> Option<String> {
        self.inner
            .shared
            .close_info
            .get()
            .map(|i| i.reason.clone())
    }

    /// Subprotocol agreed during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    #[cfg(test)]
    async fn set_mask_for_tests(&self, mask: [u8; 4]) {
        self.inner.send.lock().await.mask_override = Some(mask);
    }
}

impl<S> Drop for WebSocket<S> {
    fn drop(&mut self) {
        let inner = &self.inner;
        if !inner.shared.disposed.swap(true, Ordering::AcqRel) {
            inner.shared.set_closed();
            inner.abort.cancel();
            inner.stop_keepalive();
        }
    }
}
