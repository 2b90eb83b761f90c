//! Agent gateway server: line-delimited JSON-RPC over stdio plus an optional
//! HTTP transport.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use gateway_protocol::jsonrpc;
use gateway_protocol::jsonrpc::JsonRpcMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

mod dispatch;
mod http;
mod outgoing;

pub use dispatch::Gateway;
pub use http::http_router;
pub use outgoing::NotificationSink;
pub use outgoing::OutgoingMessageSender;

/// Size of the bounded channels between the transport tasks. Delta
/// notifications back-pressure against this buffer; the terminal response
/// shares the queue so it is never reordered ahead of its updates.
const CHANNEL_CAPACITY: usize = 128;

/// Run the stdio transport until stdin reaches EOF. One JSON message per
/// line in both directions; stdout carries nothing else.
pub async fn run_stdio(gateway: Gateway) -> std::io::Result<()> {
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
    let outgoing = OutgoingMessageSender::new(outgoing_tx);

    // Task: read stdin lines, dispatch each request on its own task so a
    // `cancel` can be processed while a prompt is still running.
    let reader_handle = tokio::spawn({
        let gateway = gateway.clone();
        let outgoing = outgoing.clone();
        async move {
            let stdin = io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(&line) {
                    Ok(JsonRpcMessage::Request(request)) => {
                        let gateway = gateway.clone();
                        let outgoing = outgoing.clone();
                        tokio::spawn(async move {
                            let sink = NotificationSink::new(outgoing.clone());
                            let response = gateway.handle_request(request, &sink).await;
                            outgoing.send(response).await;
                        });
                    }
                    Ok(JsonRpcMessage::Notification(notification)) => {
                        debug!(method = notification.method, "ignoring notification");
                    }
                    Ok(other) => debug!("ignoring non-request message: {other:?}"),
                    Err(e) => {
                        error!("failed to parse JSON-RPC message: {e}");
                        outgoing
                            .send(JsonRpcMessage::error(
                                None,
                                jsonrpc::PARSE_ERROR,
                                "Parse error",
                            ))
                            .await;
                    }
                }
            }
            debug!("stdin reader finished (EOF)");
        }
    });
    // The reader task owns the only long-lived sender clone; dropping ours
    // lets the writer observe channel close once all requests finish.
    drop(outgoing);

    // Task: write outgoing messages to stdout, one per line.
    let writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(message) = outgoing_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("failed to write to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("failed to write newline to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("failed to flush stdout: {e}");
                        break;
                    }
                }
                Err(e) => error!("failed to serialize JSON-RPC message: {e}"),
            }
        }
        info!("stdout writer exited (channel closed)");
    });

    // The reader exiting (EOF) drops the last user of the outgoing sender
    // once in-flight requests finish, which shuts down the writer.
    let _ = tokio::join!(reader_handle, writer_handle);
    Ok(())
}

/// Serve the HTTP transport on the configured port.
pub async fn run_http(gateway: Gateway, port: u16) -> std::io::Result<()> {
    let app = http_router(gateway);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http transport listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// Resolves when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("shutdown signal received");
}

/// Entry point shared by the binary: stdio transport always, HTTP alongside
/// when a port is configured.
pub async fn run_main(gateway: Gateway) -> std::io::Result<()> {
    let http_port = gateway.services().config.http_port;
    match http_port {
        Some(port) => {
            let http = run_http(gateway.clone(), port);
            let stdio = run_stdio(gateway);
            let (http_result, stdio_result) = tokio::join!(http, stdio);
            http_result.and(stdio_result)
        }
        None => run_stdio(gateway).await,
    }
}

