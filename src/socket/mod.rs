//! Connection manager for the OctoPrint push socket.
//!
//! [`PrinterSocket::connect`] spawns one task that owns the socket for the
//! lifetime of the connection: it acquires a session credential, opens the
//! socket, authenticates, feeds every frame to a [`Session`] and reconnects
//! with backoff when the socket goes away.

use crate::channels::Channels;
use crate::error::{BackendError, BridgeError, SocketError};
use crate::model::{SocketAuth, ZOffset};
use crate::protocol::encode_auth;
use crate::session::{Directive, Session, SessionOptions};
use async_trait::async_trait;
use async_tungstenite::tungstenite::Message;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

const DEFAULT_FAST_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_SLOW_DELAY: Duration = Duration::from_secs(15);
const DEFAULT_FAST_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub fast_delay: Duration,
    pub slow_delay: Duration,
    /// Failures retried after `fast_delay` before switching to `slow_delay`.
    pub fast_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            fast_delay: DEFAULT_FAST_DELAY,
            slow_delay: DEFAULT_SLOW_DELAY,
            fast_attempts: DEFAULT_FAST_ATTEMPTS,
        }
    }
}

/// Consecutive failures of one connect sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next attempt and the state that follows this failure.
    pub fn after_failure(self, policy: &BackoffPolicy) -> (Duration, Backoff) {
        let delay = if self.failures < policy.fast_attempts {
            policy.fast_delay
        } else {
            policy.slow_delay
        };
        let next = Backoff {
            failures: self.failures.saturating_add(1),
        };
        (delay, next)
    }
}

pub type Outbound = Pin<Box<dyn Sink<String, Error = SocketError> + Send>>;
pub type Inbound = Pin<Box<dyn Stream<Item = Result<String, SocketError>> + Send>>;

/// An open socket as text frames in both directions.
pub struct SocketLink {
    pub outbound: Outbound,
    pub inbound: Inbound,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<SocketLink, SocketError>;
}

/// Supplies the `{user, session}` pair the socket handshake needs.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session_key(&self) -> Result<SocketAuth, BackendError>;
}

/// One-shot reads against the backend's REST side.
#[async_trait]
pub trait PrinterBackend: Send + Sync {
    /// The backend's own view of its serial connection, e.g. `"Operational"`.
    async fn connection_state(&self) -> Result<String, BackendError>;
    async fn z_offset(&self) -> Result<ZOffset, BackendError>;
}

/// Plain `ws://` websocket transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<SocketLink, SocketError> {
        let (stream, _response) = async_tungstenite::tokio::connect_async(url)
            .await
            .map_err(|e| SocketError::Connect(e.to_string()))?;
        let (sink, stream) = stream.split();

        let outbound = sink
            .sink_map_err(|e| SocketError::Send(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, SocketError>(Message::text(text))));
        let inbound = stream.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(_)) => Some(Err(SocketError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(SocketError::Transport(e.to_string()))),
            })
        });

        Ok(SocketLink {
            outbound: Box::pin(outbound),
            inbound: Box::pin(inbound),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub url: String,
    pub reconnect: BackoffPolicy,
    pub session: SessionOptions,
}

struct Shared {
    connector: Arc<dyn Connector>,
    auth: Arc<dyn SessionProvider>,
    backend: Arc<dyn PrinterBackend>,
    options: SocketOptions,
}

/// Resolves once the first handshake of a [`PrinterSocket::connect`] call
/// is acknowledged. Reconnects never resolve it again.
pub struct Connected {
    rx: oneshot::Receiver<()>,
}

impl Future for Connected {
    type Output = Result<(), BridgeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|res| res.map_err(|_| BridgeError::ConnectionAborted))
    }
}

pub struct PrinterSocket {
    shared: Arc<Shared>,
    channels: Channels,
    task: Option<JoinHandle<()>>,
}

impl PrinterSocket {
    pub fn new(
        connector: Arc<dyn Connector>,
        auth: Arc<dyn SessionProvider>,
        backend: Arc<dyn PrinterBackend>,
        options: SocketOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                auth,
                backend,
                options,
            }),
            channels: Channels::new(),
            task: None,
        }
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Starts a fresh connection, superseding any previous one. Must be
    /// called from within a tokio runtime.
    pub fn connect(&mut self) -> Connected {
        self.disconnect();
        let session = Session::new(self.shared.options.session, self.channels.publisher());
        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        self.task = Some(tokio::spawn(run_connection(shared, session, ready_tx)));
        Connected { rx: ready_rx }
    }

    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PrinterSocket {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Results of requests running beside the socket.
enum Background {
    Credential(SocketAuth),
    ConnectionState(Result<String, BackendError>),
    ZOffset(Result<ZOffset, BackendError>),
}

async fn run_connection(shared: Arc<Shared>, mut session: Session, ready: oneshot::Sender<()>) {
    let policy = shared.options.reconnect;
    let mut ready = Some(ready);
    let mut backoff = Backoff::new();

    loop {
        let (credential, next) = acquire_credential(Arc::clone(&shared.auth), policy, backoff).await;
        backoff = next;

        let link = match shared.connector.open(&shared.options.url).await {
            Ok(link) => link,
            Err(err) => {
                backoff = wait_after_failure(policy, backoff, err.to_string()).await;
                continue;
            }
        };
        tracing::info!(url = %shared.options.url, "socket opened");

        match drive(&shared, &mut session, link, credential, backoff, &mut ready).await {
            Ok(()) => tracing::info!("socket closed"),
            Err(err) => tracing::warn!(error = %err, "socket failed"),
        }
        session.socket_closed();
        backoff = wait_after_failure(policy, backoff, SocketError::Closed.to_string()).await;
        session.reset();
    }
}

async fn wait_after_failure(policy: BackoffPolicy, backoff: Backoff, reason: String) -> Backoff {
    let (delay, next) = backoff.after_failure(&policy);
    tracing::warn!(
        reason = %reason,
        attempt = next.failures(),
        delay_ms = delay.as_millis() as u64,
        "reconnecting after delay"
    );
    tokio::time::sleep(delay).await;
    next
}

/// Retries until the provider hands out a credential.
async fn acquire_credential(
    auth: Arc<dyn SessionProvider>,
    policy: BackoffPolicy,
    mut backoff: Backoff,
) -> (SocketAuth, Backoff) {
    loop {
        match auth.session_key().await {
            Ok(credential) => return (credential, backoff),
            Err(err) => {
                let (delay, next) = backoff.after_failure(&policy);
                tracing::warn!(
                    error = %err,
                    attempt = next.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "session credential fetch failed; retrying"
                );
                tokio::time::sleep(delay).await;
                backoff = next;
            }
        }
    }
}

async fn send_auth(outbound: &mut Outbound, credential: SocketAuth) -> Result<(), SocketError> {
    let frame = encode_auth(credential).map_err(|e| SocketError::Send(e.to_string()))?;
    outbound.send(frame).await
}

/// Runs one open socket until it ends. Background requests live in a
/// `JoinSet` owned here, so their results die with the socket.
async fn drive(
    shared: &Shared,
    session: &mut Session,
    link: SocketLink,
    credential: SocketAuth,
    backoff: Backoff,
    ready: &mut Option<oneshot::Sender<()>>,
) -> Result<(), SocketError> {
    let SocketLink {
        mut outbound,
        mut inbound,
    } = link;
    let mut background: JoinSet<Background> = JoinSet::new();

    let backend = Arc::clone(&shared.backend);
    background.spawn(async move { Background::ZOffset(backend.z_offset().await) });

    send_auth(&mut outbound, credential).await?;

    loop {
        tokio::select! {
            frame = inbound.next() => {
                let text = match frame {
                    None | Some(Err(SocketError::Closed)) => return Ok(()),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(text)) => text,
                };
                match session.handle_text(&text) {
                    Some(Directive::HandshakeAcknowledged) => {
                        tracing::info!("handshake acknowledged");
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(());
                        }
                        let backend = Arc::clone(&shared.backend);
                        background.spawn(async move {
                            Background::ConnectionState(backend.connection_state().await)
                        });
                    }
                    Some(Directive::Reauthenticate) => {
                        tracing::info!("server requested re-authentication");
                        let auth = Arc::clone(&shared.auth);
                        let policy = shared.options.reconnect;
                        background.spawn(async move {
                            let (credential, _) = acquire_credential(auth, policy, backoff).await;
                            Background::Credential(credential)
                        });
                    }
                    None => {}
                }
            }
            Some(joined) = background.join_next() => {
                match joined {
                    Ok(Background::Credential(credential)) => {
                        send_auth(&mut outbound, credential).await?;
                    }
                    Ok(Background::ConnectionState(Ok(state))) => {
                        session.apply_connection_state(&state);
                    }
                    Ok(Background::ConnectionState(Err(err))) => {
                        tracing::warn!(error = %err, "connection state check failed");
                    }
                    Ok(Background::ZOffset(Ok(offset))) => session.apply_fetched_z_offset(offset),
                    Ok(Background::ZOffset(Err(err))) => {
                        tracing::warn!(error = %err, "z-offset fetch failed");
                    }
                    Err(err) => tracing::debug!(error = %err, "background request did not finish"),
                }
            }
        }
    }
}
