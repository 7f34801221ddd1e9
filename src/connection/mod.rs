//! Connection Manager: one live socket to the backend, automatic
//! reconnection on a fixed schedule, and per-method frame callbacks.

pub mod backoff;
pub mod frame;
pub mod handlers;

pub use backoff::ReconnectPolicy;
pub use frame::{FrameAction, InboundFrame, OutboundFrame, StreamDetail};
use handlers::HandlerRegistry;

use crate::config::Config;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting { attempt: u32 },
    Open,
    Closed { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// The retry ceiling was reached; nothing further is scheduled.
    ConnectivityLost { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub policy: ReconnectPolicy,
    pub hello_delay: Duration,
    pub app_name: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: ReconnectPolicy::from_config(&config.reconnect),
            hello_delay: config.reconnect.hello_delay(),
            app_name: config.server.app_name.clone(),
        }
    }
}

struct Status {
    state: ConnectionState,
    attempts: u32,
    address: Option<String>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    cancel: Option<CancellationToken>,
}

struct Shared {
    status: Mutex<Status>,
    handlers: HandlerRegistry,
    events: broadcast::Sender<ConnectionEvent>,
    options: ConnectionOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate status only while `token` is still the live one.
    fn with_status<R>(&self, token: &CancellationToken, f: impl FnOnce(&mut Status) -> R) -> Option<R> {
        let mut status = self.lock();
        if token.is_cancelled() {
            return None;
        }
        Some(f(&mut status))
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn dispatch_text(&self, text: &str) {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) if frame.method.is_empty() => {
                debug!("Dropping frame without method: {}", frame.action);
            }
            Ok(frame) => {
                self.handlers.dispatch(&frame);
            }
            Err(e) => warn!("Failed to decode frame: {}", e),
        }
    }

    fn finish_close(&self) {
        let mut status = self.lock();
        if status.state == ConnectionState::Closing {
            status.state = ConnectionState::Closed;
            drop(status);
            self.emit(ConnectionEvent::Closed {
                reason: "disconnected".to_string(),
            });
        }
    }
}

/// The single process-wide connection. Construct one and pass it where it is
/// needed; dropping it disconnects.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(options: ConnectionOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    state: ConnectionState::Idle,
                    attempts: 0,
                    address: None,
                    outbound: None,
                    cancel: None,
                }),
                handlers: HandlerRegistry::default(),
                events,
                options,
            }),
        }
    }

    /// Open a connection unless one is open or being opened. A pending
    /// reconnect timer is cancelled first. Must be called inside a tokio
    /// runtime.
    pub fn connect(&self, address: &str) {
        let token = {
            let mut status = self.shared.lock();
            if matches!(status.state, ConnectionState::Open | ConnectionState::Connecting) {
                debug!("connect ignored, connection is {:?}", status.state);
                return;
            }
            if let Some(previous) = status.cancel.take() {
                previous.cancel();
            }
            let token = CancellationToken::new();
            status.cancel = Some(token.clone());
            status.address = Some(address.to_string());
            status.state = ConnectionState::Connecting;
            status.attempts = 0;
            status.outbound = None;
            token
        };

        let shared = self.shared.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            drive(&shared, &address, &token).await;
            shared.finish_close();
        });
    }

    /// Queue a frame for the socket. Returns `false` (and sends nothing)
    /// when the connection is not open.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        match frame.to_text() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        let status = self.shared.lock();
        if status.state != ConnectionState::Open {
            debug!("send skipped, connection is {:?}", status.state);
            return false;
        }
        status
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(Message::Text(text)).is_ok())
    }

    /// Cancel timers, close the socket and reset the attempt counter.
    pub fn disconnect(&self) {
        let mut status = self.shared.lock();
        if let Some(token) = status.cancel.take() {
            token.cancel();
            status.state = match status.state {
                ConnectionState::Open => ConnectionState::Closing,
                _ => ConnectionState::Closed,
            };
            info!("Disconnecting from {}", status.address.as_deref().unwrap_or("-"));
        }
        status.outbound = None;
        status.attempts = 0;
    }

    /// Register a callback for frames whose `method` equals `method`.
    pub fn on_frame(&self, method: &str, handler: impl Fn(&InboundFrame) + Send + Sync + 'static) {
        self.shared.handlers.register(method, Arc::new(handler));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn drive(shared: &Shared, address: &str, token: &CancellationToken) {
    loop {
        let Some(attempt) = shared.with_status(token, |s| {
            s.state = ConnectionState::Connecting;
            s.attempts
        }) else {
            return;
        };
        shared.emit(ConnectionEvent::Connecting { attempt });

        let connected = tokio::select! {
            _ = token.cancelled() => return,
            result = connect_async(address) => result,
        };

        let reason = match connected {
            Ok((socket, _)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let opened = shared.with_status(token, |s| {
                    s.state = ConnectionState::Open;
                    s.attempts = 0;
                    s.outbound = Some(tx);
                });
                if opened.is_none() {
                    return;
                }
                info!("Connected to {}", address);
                shared.emit(ConnectionEvent::Open);
                pump(shared, socket, rx, token).await
            }
            Err(e) => format!("connect failed: {e}"),
        };

        // Reconnect attempts since the last open; the initial connect is not counted.
        let Some(attempts) = shared.with_status(token, |s| {
            s.state = ConnectionState::Closed;
            s.outbound = None;
            s.attempts
        }) else {
            return;
        };
        warn!("Connection to {} closed: {}", address, reason);
        shared.emit(ConnectionEvent::Closed { reason });

        let policy = &shared.options.policy;
        match policy.delay_for(attempts) {
            Some(delay) => {
                let attempt = attempts + 1;
                if shared.with_status(token, |s| s.attempts = attempt).is_none() {
                    return;
                }
                info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    policy.max_attempts()
                );
                shared.emit(ConnectionEvent::Reconnecting { attempt, delay });
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                warn!("Giving up on {} after {} attempts", address, attempts);
                shared.with_status(token, |s| s.cancel = None);
                shared.emit(ConnectionEvent::ConnectivityLost { attempts });
                return;
            }
        }
    }
}

/// Run one open socket until it closes. Returns the close reason.
async fn pump(
    shared: &Shared,
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    token: &CancellationToken,
) -> String {
    let (mut sink, mut stream) = socket.split();
    let hello = tokio::time::sleep(shared.options.hello_delay);
    tokio::pin!(hello);
    let mut hello_sent = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return "disconnected".to_string();
            }
            _ = &mut hello, if !hello_sent => {
                hello_sent = true;
                match OutboundFrame::hello(&shared.options.app_name).to_text() {
                    Ok(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            return format!("send failed: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to encode hello: {}", e),
                }
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = sink.send(message).await {
                    return format!("send failed: {e}");
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.dispatch_text(&text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => shared.dispatch_text(&text),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                        None => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("socket error: {e}"),
                None => return "stream ended".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    impl ConnectionManager {
        fn attempts(&self) -> u32 {
            self.shared.lock().attempts
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn options(delays_ms: &[u64], max_attempts: u32) -> ConnectionOptions {
        ConnectionOptions {
            policy: ReconnectPolicy::new(
                delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
                max_attempts,
            ),
            hello_delay: Duration::from_millis(10),
            app_name: "test".to_string(),
        }
    }

    #[test]
    fn send_is_noop_when_not_open() {
        let manager = ConnectionManager::new(options(&[1], 1));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!manager.send(&OutboundFrame::hello("x")));
    }

    #[tokio::test]
    async fn sends_hello_and_dispatches_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let hello = ws.next().await.unwrap().unwrap().into_text().unwrap();
            for text in [
                r#"{"method":"message","action":"respond","taskid":"t1"}"#,
                "not json",
                r#"{"action":"stream"}"#,
                r#"{"method":"message","action":"control","taskid":"t1","detail":"done"}"#,
            ] {
                ws.send(Message::Text(text.to_string())).await.unwrap();
            }
            let echoed = ws.next().await.unwrap().unwrap().into_text().unwrap();
            (hello, echoed)
        });

        let manager = ConnectionManager::new(options(&[5], 1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_frame("message", move |frame| {
            let _ = tx.send(frame.action.clone());
        });
        manager.connect(&format!("ws://{addr}"));

        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("respond"));
        let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(second.as_deref(), Some("control"));

        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(manager.send(&OutboundFrame::user_input(Some("t1"), "hi", false)));

        let (hello, echoed) = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(hello, r#"{"method":"system","action":"hello","detail":"hi,test"}"#);
        assert!(echoed.contains(r#""action":"user-input""#));
        manager.disconnect();
    }

    #[tokio::test]
    async fn gives_up_after_retry_ceiling() {
        let manager = ConnectionManager::new(options(&[1], 2));
        let mut events = manager.subscribe();
        manager.connect("ws://127.0.0.1:1");

        let mut reconnects = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                ConnectionEvent::Reconnecting { attempt, .. } => reconnects.push(attempt),
                ConnectionEvent::ConnectivityLost { attempts } => {
                    assert_eq!(attempts, 2);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(reconnects, vec![1, 2]);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let manager = ConnectionManager::new(options(&[60_000], 10));
        let mut events = manager.subscribe();
        manager.connect("ws://127.0.0.1:1");
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, ConnectionEvent::Reconnecting { .. }) {
                break;
            }
        }
        assert_eq!(manager.attempts(), 1);
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test]
    async fn schedule_restarts_after_each_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // Accept, then close straight away, over and over.
            while let Ok((socket, _)) = listener.accept().await {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    continue;
                };
                let _ = ws.close(None).await;
                while let Some(Ok(_)) = ws.next().await {}
            }
        });

        let manager = ConnectionManager::new(options(&[5, 5_000], 10));
        let mut events = manager.subscribe();
        manager.connect(&format!("ws://{addr}"));

        let mut opens = 0;
        let mut reconnects = Vec::new();
        while reconnects.len() < 3 {
            match next_event(&mut events).await {
                ConnectionEvent::Open => opens += 1,
                ConnectionEvent::Reconnecting { attempt, delay } => reconnects.push((attempt, delay)),
                ConnectionEvent::ConnectivityLost { .. } => panic!("gave up on a live server"),
                _ => {}
            }
        }
        assert_eq!(opens, 3);
        assert_eq!(reconnects, vec![(1, Duration::from_millis(5)); 3]);
        manager.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn connect_replaces_pending_reconnect_timer() {
        let manager = ConnectionManager::new(options(&[300], 10));
        let mut events = manager.subscribe();
        manager.connect("ws://127.0.0.1:1");
        loop {
            if matches!(next_event(&mut events).await, ConnectionEvent::Reconnecting { .. }) {
                break;
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        manager.connect(&format!("ws://{addr}"));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connecting { attempt: 0 });
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Open);

        // Well past the old 300ms timer: it must not have fired.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(manager.attempts(), 0);

        manager.disconnect();
        server.abort();
    }
}
