use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionOptions, InboundFrame, OutboundFrame};
use crate::stream::{AssemblerEvent, StreamAssembler, StreamSettings};
use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub address: String,
    pub task_id: Option<String>,
    pub subtasks: Vec<String>,
    /// Sent as a `user-input` frame once the connection is up.
    pub initial_message: Option<String>,
    pub connection: ConnectionOptions,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connection(ConnectionEvent),
    Assembler(AssemblerEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    ConnectivityLost,
}

/// Drive one connection and one assembler until `shutdown` fires or the
/// connection gives up. Every event is forwarded to `sink`.
pub async fn run(
    options: ClientOptions,
    sink: mpsc::UnboundedSender<ClientEvent>,
    shutdown: CancellationToken,
) -> Result<RunOutcome> {
    let manager = ConnectionManager::new(options.connection.clone());
    let (frame_tx, mut frames) = mpsc::unbounded_channel::<InboundFrame>();
    manager.on_frame("message", move |frame| {
        let _ = frame_tx.send(frame.clone());
    });
    manager.on_frame("system", |frame| {
        debug!("System frame {}: {}", frame.action, frame.detail);
    });
    let mut connection_events = manager.subscribe();

    let mut assembler = StreamAssembler::new(options.stream);
    assembler.set_primary(options.task_id.clone());
    assembler.set_subtasks(options.subtasks.clone());

    let mut pending_message = options.initial_message.clone();
    let mut send_at: Option<Instant> = None;

    info!("Connecting to {}", options.address);
    manager.connect(&options.address);

    loop {
        let deadline = match (assembler.next_deadline(), send_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = shutdown.cancelled() => {
                let in_flight = assembler.current().map_or(0, |m| m.actions.len());
                info!(
                    "Shutting down ({:?}), running: {}, in-flight actions: {}, stats: {:?}",
                    manager.state(),
                    assembler.is_running(),
                    in_flight,
                    assembler.stats()
                );
                if let Some(error) = assembler.error_message() {
                    warn!("Last run error: {}", error);
                }
                manager.disconnect();
                return Ok(RunOutcome::Shutdown);
            }
            Some(frame) = frames.recv() => {
                for event in assembler.handle_frame(&frame, Instant::now()) {
                    if sink.send(ClientEvent::Assembler(event)).is_err() {
                        manager.disconnect();
                        return Ok(RunOutcome::Shutdown);
                    }
                }
            }
            event = connection_events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} connection events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return Ok(RunOutcome::Shutdown),
                };
                let lost = matches!(event, ConnectionEvent::ConnectivityLost { .. });
                if event == ConnectionEvent::Open && pending_message.is_some() {
                    send_at = Some(Instant::now() + options.connection.hello_delay);
                }
                let _ = sink.send(ClientEvent::Connection(event));
                if lost {
                    return Ok(RunOutcome::ConnectivityLost);
                }
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at)), if deadline.is_some() => {
                let now = Instant::now();
                if send_at.is_some_and(|at| at <= now) {
                    send_at = None;
                    if let Some(content) = pending_message.as_deref() {
                        // A `respond` frame may have adopted a task id meanwhile.
                        let task = assembler.primary();
                        let frame = OutboundFrame::user_input(task, content, task.is_none());
                        // Kept for the next open when the socket dropped meanwhile.
                        if manager.send(&frame) {
                            pending_message = None;
                        }
                    }
                }
                for event in assembler.on_timer(now) {
                    if sink.send(ClientEvent::Assembler(event)).is_err() {
                        manager.disconnect();
                        return Ok(RunOutcome::Shutdown);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    fn options(address: String, message: Option<&str>) -> ClientOptions {
        ClientOptions {
            address,
            task_id: Some("t1".to_string()),
            subtasks: Vec::new(),
            initial_message: message.map(str::to_string),
            connection: ConnectionOptions {
                policy: ReconnectPolicy::new(vec![Duration::from_millis(5)], 1),
                hello_delay: Duration::from_millis(10),
                app_name: "test".to_string(),
            },
            stream: StreamSettings {
                tick_interval: Duration::from_millis(20),
                grace_delay: Duration::from_millis(50),
            },
        }
    }

    #[tokio::test]
    async fn streams_fragments_into_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let mut received = Vec::new();
            for _ in 0..2 {
                received.push(ws.next().await.unwrap().unwrap().into_text().unwrap());
            }
            for text in [
                r#"{"method":"message","action":"control","taskid":"t1","detail":"running"}"#,
                r#"{"method":"message","action":"respond","taskid":"t1"}"#,
                r#"{"method":"message","action":"stream","taskid":"t1","detail":{"idx":0,"str":"data:w1:m1"}}"#,
                r#"{"method":"message","action":"stream","taskid":"t1","detail":{"idx":1,"str":"Listing files.<execute-command>"}}"#,
                r#"{"method":"message","action":"stream","taskid":"t1","detail":{"idx":2,"str":"<command>ls</command></execute-command>"}}"#,
            ] {
                ws.send(Message::Text(text.to_string())).await.unwrap();
            }
            // Hold the socket open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
            received
        });

        let (sink, mut events) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            options(format!("ws://{addr}"), Some("list the files")),
            sink,
            shutdown.clone(),
        ));

        let message = timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let ClientEvent::Assembler(AssemblerEvent::Message { message, .. }) = event {
                    if message.tool_actions().count() == 1 {
                        return message;
                    }
                }
            }
            panic!("event stream ended");
        })
        .await
        .unwrap();
        assert_eq!(message.msg_id.as_deref(), Some("m1"));
        assert_eq!(message.replies().collect::<Vec<_>>(), vec!["Listing files."]);

        shutdown.cancel();
        let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Shutdown);

        let received = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert!(received.iter().any(|t| t.contains(r#""action":"hello""#)));
        assert!(received
            .iter()
            .any(|t| t.contains(r#""action":"user-input""#) && t.contains("list the files")));
    }

    #[tokio::test]
    async fn reports_connectivity_loss() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let outcome = timeout(
            Duration::from_secs(5),
            run(options("ws://127.0.0.1:1".to_string(), None), sink, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome, RunOutcome::ConnectivityLost);

        let mut saw_lost = false;
        while let Ok(event) = events.try_recv() {
            saw_lost |= matches!(
                event,
                ClientEvent::Connection(ConnectionEvent::ConnectivityLost { .. })
            );
        }
        assert!(saw_lost);
    }
}
