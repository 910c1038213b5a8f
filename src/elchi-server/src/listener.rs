// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! JSON-over-TCP listener for elchi-server.
//!
//! Clients send one [`EngineCommand`] per line and receive every
//! [`EngineEvent`] broadcast by the engine, also one JSON object per line.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use elchi_core::{EngineCommand, EngineEvent};

/// Run the JSON TCP listener, accepting client connections.
pub async fn run_listener(
    addr: SocketAddr,
    cmd_tx: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    serve(listener, cmd_tx, events, shutdown_rx).await
}

async fn serve(
    listener: TcpListener,
    cmd_tx: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        info!("Client connected: {}", peer);

        let tx = cmd_tx.clone();
        let events_rx = events.subscribe();
        let client_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, peer, tx, events_rx, client_shutdown).await {
                error!("Client {} error: {:?}", peer, e);
            }
        });
    }
}

async fn write_event(writer: &mut OwnedWriteHalf, event: &EngineEvent) -> std::io::Result<()> {
    let line = serde_json::to_string(event)? + "\n";
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    tx: mpsc::Sender<EngineCommand>,
    mut events: broadcast::Receiver<EngineEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Client {} disconnected", addr);
                    break;
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let cmd = match serde_json::from_str::<EngineCommand>(trimmed) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        error!("Invalid JSON from {}: {} / {:?}", addr, trimmed, e);
                        let resp = EngineEvent::error(format!("Invalid JSON: {}", e));
                        write_event(&mut writer, &resp).await?;
                        continue;
                    }
                };

                if let Err(e) = tx.send(cmd).await {
                    error!("Failed to send command to engine: {:?}", e);
                    let resp = EngineEvent::error("Internal error: engine not available");
                    write_event(&mut writer, &resp).await?;
                }
            }
            event = events.recv() => match event {
                Ok(event) => write_event(&mut writer, &event).await?,
                Err(RecvError::Lagged(n)) => warn!("Client {} skipped {} events", addr, n),
                Err(RecvError::Closed) => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use elchi_core::DeviceKind;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    struct Fixture {
        addr: SocketAddr,
        commands: mpsc::Receiver<EngineCommand>,
        events: broadcast::Sender<EngineEvent>,
        _shutdown: watch::Sender<bool>,
    }

    async fn fixture() -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (cmd_tx, commands) = mpsc::channel(8);
        let (events, _) = broadcast::channel(16);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(listener, cmd_tx, events.clone(), shutdown_rx));
        Fixture {
            addr,
            commands,
            events,
            _shutdown: shutdown,
        }
    }

    async fn read_json(
        lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    ) -> serde_json::Value {
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_commands_reach_engine() {
        let mut fx = fixture().await;
        let mut socket = TcpStream::connect(fx.addr).await.unwrap();
        socket
            .write_all(b"\n{\"cmd\":\"disconnect\",\"kind\":\"sensor\"}\n")
            .await
            .unwrap();
        let cmd = timeout(Duration::from_secs(5), fx.commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            EngineCommand::Disconnect {
                kind: DeviceKind::Sensor
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_line() {
        let fx = fixture().await;
        let socket = TcpStream::connect(fx.addr).await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer.write_all(b"{\"cmd\":\"warp\"}\n").await.unwrap();

        let reply = read_json(&mut lines).await;
        assert_eq!(reply["event"], "error");
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON"));
    }

    #[tokio::test]
    async fn test_events_are_streamed() {
        let fx = fixture().await;
        let socket = TcpStream::connect(fx.addr).await.unwrap();
        let (reader, _writer) = socket.into_split();
        let mut lines = BufReader::new(reader).lines();

        // The client subscribes once it has been accepted.
        timeout(Duration::from_secs(5), async {
            while fx.events.receiver_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        fx.events
            .send(EngineEvent::Connected {
                kind: DeviceKind::Controller,
                model: "Test Controller".to_string(),
            })
            .unwrap();

        let event = read_json(&mut lines).await;
        assert_eq!(event["event"], "connected");
        assert_eq!(event["kind"], "controller");
        assert_eq!(event["model"], "Test Controller");
    }
}
