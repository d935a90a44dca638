//! Gateway WebSocket client.
//!
//! One driver task per started client owns the transport. It opens the
//! WebSocket, runs the signed handshake, dispatches replies and events,
//! and reconnects with backoff until [`GatewayClient::stop`] is called.
//! Callers share the pending-request table with the driver through a
//! mutex that is never held across an await.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use claw_identity::{
    DeviceAuthPayload, DeviceIdentityManager, DeviceTokenStore, now_ms, sign_device,
};
use claw_persist::KeyValueStore;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::events::{CloseInfo, GatewayHandler, SequenceTracker};
use crate::options::GatewayClientOptions;
use crate::protocol::{
    CHALLENGE_EVENT, CONNECT_FAILED_CLOSE_CODE, CONNECT_METHOD, ChallengePayload, ClientInfo,
    ConnectAuth, ConnectParams, GatewayFrame, HelloAuth, RequestFrame,
};
use crate::reconnect::Backoff;
use crate::state::{AtomicConnectionState, ConnectionState};

type Reply = Result<Value, GatewayError>;

/// Authenticated, self-reconnecting gateway RPC client.
///
/// Cheap to clone; clones share one connection. The driver keeps running
/// until [`GatewayClient::stop`] is called, so call it before dropping the
/// last handle.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

struct Inner {
    options: GatewayClientOptions,
    identity: DeviceIdentityManager,
    tokens: DeviceTokenStore,
    handler: Arc<dyn GatewayHandler>,
    state: AtomicConnectionState,
    shared: Mutex<Shared>,
}

struct Shared {
    session: Option<Session>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<String, oneshot::Sender<Reply>>,
    backoff: Backoff,
    sequence: SequenceTracker,
    hello: Option<Value>,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Handshake state of one transport lifetime, reset as a unit.
#[derive(Debug, Default)]
struct ConnectAttempt {
    nonce: Option<String>,
    sent: bool,
    authenticated: bool,
    device_id: Option<String>,
    tried_device_token: bool,
}

impl GatewayClient {
    /// Create a client. Identity and device tokens are read from and
    /// written to `store`, which may be shared with other clients.
    pub fn new(
        options: GatewayClientOptions,
        store: Arc<dyn KeyValueStore>,
        handler: impl GatewayHandler,
    ) -> Self {
        let backoff = Backoff::new(options.reconnect);
        Self {
            inner: Arc::new(Inner {
                identity: DeviceIdentityManager::new(Arc::clone(&store)),
                tokens: DeviceTokenStore::new(store),
                options,
                handler: Arc::new(handler),
                state: AtomicConnectionState::new(ConnectionState::Idle),
                shared: Mutex::new(Shared {
                    session: None,
                    outbound: None,
                    pending: HashMap::new(),
                    backoff,
                    sequence: SequenceTracker::default(),
                    hello: None,
                }),
            }),
        }
    }

    /// Client options.
    #[must_use]
    pub fn options(&self) -> &GatewayClientOptions {
        &self.inner.options
    }

    /// Device token cache used by this client.
    #[must_use]
    pub fn tokens(&self) -> &DeviceTokenStore {
        &self.inner.tokens
    }

    /// Device identity manager used by this client.
    #[must_use]
    pub fn identity(&self) -> &DeviceIdentityManager {
        &self.inner.identity
    }

    /// Start connecting. Calling this while already running does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut shared = self.inner.shared.lock();
        if shared
            .session
            .as_ref()
            .is_some_and(|s| !s.cancel.is_cancelled())
        {
            return;
        }

        let previous = shared.session.take().map(|s| s.task);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.inner).drive(cancel.clone(), previous));
        shared.session = Some(Session { cancel, task });
    }

    /// Close the connection, fail every outstanding request, and suppress
    /// reconnection until [`GatewayClient::start`] is called again.
    pub fn stop(&self) {
        let pending = {
            let mut shared = self.inner.shared.lock();
            if let Some(session) = &shared.session {
                session.cancel.cancel();
            }
            shared.outbound = None;
            std::mem::take(&mut shared.pending)
        };
        for (_, waiter) in pending {
            let _ = waiter.send(Err(GatewayError::Stopped));
        }
        self.inner.state.store(ConnectionState::Stopped);
    }

    /// Whether a transport is open. This does not imply the handshake has
    /// completed; see [`GatewayClient::connection_state`].
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.shared.lock().outbound.is_some()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Payload of the most recent successful handshake.
    #[must_use]
    pub fn hello(&self) -> Option<Value> {
        self.inner.shared.lock().hello.clone()
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    /// Highest event sequence number seen on the current connection.
    #[must_use]
    pub fn last_seq(&self) -> Option<u64> {
        self.inner.shared.lock().sequence.last()
    }

    /// Call `method` and wait for its reply.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`GatewayError::NotConnected`] when no
    /// transport is open. Otherwise fails with the server's rejection, or
    /// with [`GatewayError::Closed`] / [`GatewayError::Stopped`] if the
    /// connection goes away first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let reply = self.inner.send_request(method, params)?;
        reply.await.unwrap_or(Err(GatewayError::ConnectionLost))
    }

    /// Typed variant of [`GatewayClient::request`].
    pub async fn request_as<T, P>(&self, method: &str, params: P) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        let value = self.request(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Inner {
    fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<Reply>, GatewayError> {
        let id = Uuid::new_v4().to_string();
        let text = GatewayFrame::Req(RequestFrame {
            id: id.clone(),
            method: method.to_string(),
            params,
        })
        .to_json()?;

        let (tx, rx) = oneshot::channel();
        let mut shared = self.shared.lock();
        let outbound = shared.outbound.as_ref().ok_or(GatewayError::NotConnected)?;
        outbound.send(text).map_err(|_| GatewayError::NotConnected)?;
        shared.pending.insert(id, tx);
        Ok(rx)
    }

    async fn drive(self: Arc<Self>, cancel: CancellationToken, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        while !cancel.is_cancelled() {
            self.state.store(ConnectionState::Connecting);
            debug!(url = %self.options.url, "connecting to gateway");

            let close = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = timeout(
                    self.options.connect_timeout,
                    tokio_tungstenite::connect_async(self.options.url.as_str()),
                ) => match result {
                    Ok(Ok((ws, _))) => self.run_transport(ws, &cancel).await,
                    Ok(Err(e)) => CloseInfo::abnormal(format!("connect failed: {e}")),
                    Err(_) => CloseInfo::abnormal("connect timed out"),
                },
            };

            self.handle_close(&close);
            if cancel.is_cancelled() {
                break;
            }

            let delay = self.shared.lock().backoff.advance();
            self.state.store(ConnectionState::Reconnecting);
            info!(
                code = close.code,
                reason = %close.reason,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "gateway connection closed, reconnecting"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        self.state.store(ConnectionState::Stopped);
        debug!("gateway driver stopped");
    }

    async fn run_transport<S>(&self, ws: WebSocketStream<S>, cancel: &CancellationToken) -> CloseInfo
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        {
            let mut shared = self.shared.lock();
            shared.outbound = Some(out_tx);
            shared.sequence.reset();
        }
        self.state.store(ConnectionState::AwaitingChallenge);
        debug!("transport open, waiting for challenge");

        let mut attempt = ConnectAttempt::default();
        let mut hello: Option<oneshot::Receiver<Reply>> = None;
        let debounce = sleep(self.options.handshake_delay);
        tokio::pin!(debounce);

        let close = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    send_close(&mut write, CloseInfo::NORMAL, "client stopped").await;
                    break CloseInfo::new(CloseInfo::NORMAL, "client stopped");
                }
                () = &mut debounce, if !attempt.sent => {
                    match self.send_connect(&mut attempt) {
                        Ok(rx) => hello = Some(rx),
                        Err(e) => break self.fail_handshake(&mut write, &mut attempt, &e).await,
                    }
                }
                reply = wait_reply(&mut hello), if hello.is_some() => {
                    hello = None;
                    match reply {
                        Ok(payload) => self.on_authenticated(&mut attempt, payload),
                        Err(GatewayError::Stopped) => {
                            break CloseInfo::new(CloseInfo::NORMAL, "client stopped");
                        }
                        Err(e) => break self.fail_handshake(&mut write, &mut attempt, &e).await,
                    }
                }
                outgoing = out_rx.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            break CloseInfo::abnormal(format!("write failed: {e}"));
                        }
                    }
                    None => break CloseInfo::new(CloseInfo::NORMAL, "client stopped"),
                },
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Some(nonce) = self.dispatch(text.as_str()) else {
                            continue;
                        };
                        attempt.nonce = Some(nonce);
                        if attempt.sent {
                            debug!("challenge arrived after connect was sent, not resending");
                            continue;
                        }
                        match self.send_connect(&mut attempt) {
                            Ok(rx) => hello = Some(rx),
                            Err(e) => break self.fail_handshake(&mut write, &mut attempt, &e).await,
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || CloseInfo::new(1005, "no status"),
                            |f| CloseInfo::new(u16::from(f.code), f.reason.as_str()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseInfo::abnormal(e.to_string()),
                    None => break CloseInfo::abnormal("connection closed"),
                },
            }
        };

        if attempt.sent && !attempt.authenticated && !cancel.is_cancelled() {
            self.discard_tried_token(&mut attempt);
        }
        close
    }

    /// Build, sign, and send the `connect` request for this attempt.
    fn send_connect(
        &self,
        attempt: &mut ConnectAttempt,
    ) -> Result<oneshot::Receiver<Reply>, GatewayError> {
        attempt.sent = true;
        self.state.store(ConnectionState::Authenticating);
        let params = self.connect_params(attempt)?;
        debug!(
            role = %params.role,
            signed = params.device.is_some(),
            nonce = attempt.nonce.is_some(),
            "sending connect"
        );
        self.send_request(CONNECT_METHOD, serde_json::to_value(&params)?)
    }

    fn connect_params(&self, attempt: &mut ConnectAttempt) -> Result<ConnectParams, GatewayError> {
        let opts = &self.options;
        let mut auth = ConnectAuth {
            token: opts.token.clone(),
            password: opts.password.clone(),
        };

        let device = if opts.device_auth {
            let identity = self.identity.ensure_identity();
            if let Some(cached) = self.tokens.get(&identity.device_id, &opts.role) {
                auth.token = Some(cached.token);
                attempt.tried_device_token = true;
            }
            let payload = DeviceAuthPayload {
                device_id: identity.device_id.clone(),
                client_id: opts.client_id.clone(),
                client_mode: opts.client_mode.clone(),
                role: opts.role.clone(),
                scopes: opts.scopes.clone(),
                signed_at_ms: now_ms(),
                token: auth.token.clone(),
                nonce: attempt.nonce.clone(),
            };
            let proof = sign_device(&identity, &payload)?;
            attempt.device_id = Some(identity.device_id);
            Some(proof)
        } else {
            None
        };

        Ok(ConnectParams {
            min_protocol: opts.min_protocol,
            max_protocol: opts.max_protocol,
            client: ClientInfo {
                id: opts.client_id.clone(),
                display_name: opts.display_name.clone(),
                version: opts.client_version.clone(),
                platform: opts.platform.clone(),
                mode: opts.client_mode.clone(),
                instance_id: opts.instance_id.clone(),
            },
            role: opts.role.clone(),
            scopes: opts.scopes.clone(),
            device,
            caps: Vec::new(),
            auth: (!auth.is_empty()).then_some(auth),
            user_agent: opts.user_agent.clone(),
            locale: opts.locale.clone(),
        })
    }

    fn on_authenticated(&self, attempt: &mut ConnectAttempt, hello: Value) {
        attempt.authenticated = true;
        {
            let mut shared = self.shared.lock();
            shared.backoff.reset();
            shared.hello = Some(hello.clone());
        }
        self.state.store(ConnectionState::Open);

        if let (Some(device_id), Some(auth)) = (&attempt.device_id, HelloAuth::from_hello(&hello)) {
            let role = auth.role.as_deref().unwrap_or(&self.options.role);
            match self.tokens.set(device_id, role, &auth.device_token, &auth.scopes) {
                Ok(_) => debug!(role, "stored device token"),
                Err(e) => warn!(error = %e, "failed to store device token"),
            }
        }

        info!(url = %self.options.url, "gateway handshake complete");
        self.notify("on_hello", || self.handler.on_hello(&hello));
    }

    async fn fail_handshake<S>(
        &self,
        write: &mut SplitSink<WebSocketStream<S>, Message>,
        attempt: &mut ConnectAttempt,
        err: &GatewayError,
    ) -> CloseInfo
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        warn!(error = %err, "gateway handshake failed");
        self.discard_tried_token(attempt);
        send_close(write, CONNECT_FAILED_CLOSE_CODE, "connect failed").await;
        CloseInfo::new(CONNECT_FAILED_CLOSE_CODE, "connect failed")
    }

    /// Forget a cached device token the gateway did not accept.
    fn discard_tried_token(&self, attempt: &mut ConnectAttempt) {
        if !std::mem::take(&mut attempt.tried_device_token) {
            return;
        }
        let Some(device_id) = &attempt.device_id else {
            return;
        };
        match self.tokens.clear(device_id, &self.options.role) {
            Ok(()) => info!(role = %self.options.role, "cleared rejected device token"),
            Err(e) => warn!(error = %e, "failed to clear device token"),
        }
    }

    /// Handle one inbound text frame. Returns a challenge nonce when the
    /// frame is a `connect.challenge`.
    fn dispatch(&self, text: &str) -> Option<String> {
        let Some(frame) = GatewayFrame::parse(text) else {
            debug!(len = text.len(), "dropping malformed gateway frame");
            return None;
        };

        match frame {
            GatewayFrame::Res(res) => {
                let waiter = self.shared.lock().pending.remove(&res.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(res.into_result());
                    }
                    None => debug!(id = %res.id, "reply for unknown request"),
                }
                None
            }
            GatewayFrame::Event(event) if event.event == CHALLENGE_EVENT => {
                let nonce = ChallengePayload::nonce_from(&event.payload);
                if nonce.is_none() {
                    debug!("challenge without nonce ignored");
                }
                nonce
            }
            GatewayFrame::Event(event) => {
                if let Some(seq) = event.seq {
                    let gap = self.shared.lock().sequence.observe(seq);
                    if let Some(gap) = gap {
                        warn!(expected = gap.expected, received = gap.received, "event sequence gap");
                        self.notify("on_gap", || self.handler.on_gap(gap));
                    }
                }
                self.notify("on_event", || self.handler.on_event(&event));
                None
            }
            GatewayFrame::Req(req) => {
                debug!(method = %req.method, "ignoring request frame from gateway");
                None
            }
        }
    }

    fn handle_close(&self, close: &CloseInfo) {
        let pending = {
            let mut shared = self.shared.lock();
            shared.outbound = None;
            std::mem::take(&mut shared.pending)
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending requests");
        }
        for (_, waiter) in pending {
            let _ = waiter.send(Err(GatewayError::Closed {
                code: close.code,
                reason: close.reason.clone(),
            }));
        }
        self.state.store(ConnectionState::Closed);
        self.notify("on_close", || self.handler.on_close(close));
    }

    /// Run a handler callback, logging instead of propagating a panic.
    fn notify(&self, callback: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(callback, "gateway handler panicked");
        }
    }
}

async fn wait_reply(reply: &mut Option<oneshot::Receiver<Reply>>) -> Reply {
    match reply {
        Some(rx) => rx.await.unwrap_or(Err(GatewayError::ConnectionLost)),
        None => std::future::pending().await,
    }
}

async fn send_close<S>(write: &mut SplitSink<WebSocketStream<S>, Message>, code: u16, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = write.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "failed to send close frame");
    }
}
