//! A minimal HTTP/1.x server for the web interface.

use crate::views::{MailView, Response, reason};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Take};
use tokio::net::{TcpListener, TcpStream};

/// Requests with longer heads, request line included, are rejected.
const MAX_HEAD_SIZE: u64 = 16 * 1024;

/// Input read and discarded after rejecting an oversized head.
const MAX_DRAIN: u64 = 1024 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Serves `view` on `listener`, one request per connection.
pub async fn run_http_server(
    listener: TcpListener,
    view: Arc<MailView>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    log::info!("HTTP server listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await?;
        let view = view.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, peer, view).await {
                log::error!("Error handling HTTP connection from {peer}: {e}");
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    view: Arc<MailView>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut head = (&mut reader).take(MAX_HEAD_SIZE);

    let mut request_line = String::new();
    if head.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let mut too_large = exhausted(&head, &request_line);

    // Skip the headers, nothing in them changes the answer.
    let mut header = String::new();
    while !too_large {
        header.clear();
        let n = head.read_line(&mut header).await?;
        too_large = exhausted(&head, &header);
        if !too_large && (n == 0 || header.trim_end().is_empty()) {
            break;
        }
    }

    if too_large {
        log::debug!("{peer} sent a request head over {MAX_HEAD_SIZE} bytes");
        write_response(&mut writer, &Response::error(400), true).await?;
        // Unread input would turn the close into a reset and lose the answer.
        let mut rest = (&mut reader).take(MAX_DRAIN);
        let mut sink = tokio::io::sink();
        let drain = tokio::io::copy(&mut rest, &mut sink);
        if let Ok(Err(e)) = tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            log::debug!("Failed to drain request from {peer}: {e}");
        }
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => {
            write_response(&mut writer, &Response::error(400), true).await?;
            return Ok(());
        }
    };

    let response = match method {
        "GET" | "HEAD" => view.respond(path),
        _ => Response::error(501),
    };
    log::debug!("{peer} {method} {path} {}", response.status);
    write_response(&mut writer, &response, method != "HEAD").await?;
    Ok(())
}

/// Whether reading `line` hit the head limit before the end of the line.
fn exhausted<R: AsyncRead>(head: &Take<R>, line: &str) -> bool {
    head.limit() == 0 && !line.ends_with('\n')
}

async fn write_response<W>(
    writer: &mut W,
    response: &Response,
    with_body: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason(response.status));
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if response.header("Content-Length").is_none() {
        head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");

    writer.write_all(head.as_bytes()).await?;
    if with_body {
        writer.write_all(&response.body).await?;
    }
    writer.flush().await?;
    writer.shutdown().await
}
