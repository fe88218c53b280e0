//! A minimal SMTP server accepting every message it is offered.

use crate::utils::extract_address;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Longest accepted command line, CRLF included.
const MAX_COMMAND_LINE: u64 = 4096;

/// Represents an SMTP envelope with sender, recipients, and raw message data.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub peer: SocketAddr,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: Vec<u8>,
}

impl Envelope {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            mail_from: String::new(),
            rcpt_to: Vec::new(),
            data: Vec::new(),
        }
    }
}

/// Trait defining the SMTP handler interface.
#[async_trait]
pub trait SmtpHandler: Send + Sync {
    /// Handles the MAIL FROM command.
    fn handle_mail(&self, _address: &str) -> Result<(), String> {
        Ok(())
    }

    /// Handles a complete message after the end of DATA.
    ///
    /// Returns the full SMTP reply line, e.g. `250 OK`.
    async fn handle_data(&self, envelope: &Envelope) -> Result<String, String>;
}

/// Binds `addr`, retrying once after `grace` if the first attempt fails.
pub async fn bind(addr: &str, grace: Option<Duration>) -> std::io::Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            let Some(grace) = grace else {
                return Err(e);
            };
            log::warn!("Failed to bind {addr}: {e}, retrying in {grace:?}");
            tokio::time::sleep(grace).await;
            TcpListener::bind(addr).await
        }
    }
}

/// Runs the SMTP server on `listener` with the given handler and maximum message size.
pub async fn run_smtp_server<H>(
    listener: TcpListener,
    handler: Arc<H>,
    max_size: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    H: SmtpHandler + 'static,
{
    log::info!("SMTP server listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, peer, handler, max_size).await {
                log::error!("Error handling SMTP connection from {peer}: {e}");
            }
        });
    }
}

/// Handles an individual SMTP connection.
async fn handle_connection<H>(
    socket: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    max_size: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    H: SmtpHandler,
{
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    writer.write_all(b"220 mockmail SMTP\r\n").await?;

    let mut envelope = Envelope::new(peer);
    // A DATA line this long already exceeds the size limit.
    let max_data_line = u64::try_from(max_size.saturating_add(2)).unwrap_or(u64::MAX);

    'connection: loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_COMMAND_LINE);
        let n = limited.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break 'connection;
        }
        if limited.limit() == 0 && !line.ends_with(b"\n") {
            writer.write_all(b"500 Line too long\r\n").await?;
            break 'connection;
        }

        let cmd = String::from_utf8_lossy(&line);
        let cmd = cmd.trim_end_matches(['\r', '\n']);
        log::debug!("Received: {}", cmd);
        let upper = cmd.to_ascii_uppercase();

        if upper.starts_with("HELO") || upper.starts_with("EHLO") {
            writer.write_all(b"250 OK\r\n").await?;
        } else if upper.starts_with("MAIL FROM:") {
            if let Some(from) = extract_address(cmd) {
                match handler.handle_mail(&from) {
                    Ok(_) => {
                        envelope = Envelope::new(peer);
                        envelope.mail_from = from;
                        writer.write_all(b"250 OK\r\n").await?;
                    }
                    Err(e) => {
                        writer.write_all(format!("{}\r\n", e).as_bytes()).await?;
                    }
                }
            } else {
                log::debug!("Invalid MAIL FROM command. Can't extract address.");
                writer
                    .write_all(b"501 Invalid address in MAIL FROM\r\n")
                    .await?;
            }
        } else if upper.starts_with("RCPT TO:") {
            if let Some(to) = extract_address(cmd) {
                envelope.rcpt_to.push(to);
                writer.write_all(b"250 OK\r\n").await?;
            } else {
                writer
                    .write_all(b"501 Invalid address in RCPT TO\r\n")
                    .await?;
            }
        } else if upper.starts_with("DATA") {
            writer
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;
            let mut data = Vec::new();
            let mut data_line = Vec::new();
            'data_read: loop {
                data_line.clear();
                let mut limited = (&mut reader).take(max_data_line);
                if limited.read_until(b'\n', &mut data_line).await? == 0 {
                    log::warn!("Connection closed during DATA");
                    break 'connection;
                }

                if data_line == b".\r\n" || data_line == b".\n" {
                    break 'data_read;
                }

                // Dot-unstuffing.
                let content = match data_line.strip_prefix(b".") {
                    Some(rest) => rest,
                    None => &data_line,
                };
                data.extend_from_slice(content);

                if data.len() > max_size {
                    writer
                        .write_all(b"552 Message exceeds maximum size\r\n")
                        .await?;
                    break 'connection;
                }
            }

            envelope.data = data;

            match handler.handle_data(&envelope).await {
                Ok(response) => {
                    log::debug!("Sent: {}", response);
                    writer
                        .write_all(format!("{}\r\n", response).as_bytes())
                        .await?;
                }
                Err(e) => {
                    log::debug!("Sent: {}", e);
                    writer.write_all(format!("{}\r\n", e).as_bytes()).await?;
                }
            }

            envelope = Envelope::new(peer);
        } else if upper.starts_with("QUIT") {
            writer.write_all(b"221 OK\r\n").await?;
            break 'connection;
        } else if upper.starts_with("RSET") {
            envelope = Envelope::new(peer);
            writer.write_all(b"250 OK\r\n").await?;
        } else if upper.starts_with("NOOP") {
            writer.write_all(b"250 OK\r\n").await?;
        } else {
            writer.write_all(b"500 Command not recognized\r\n").await?;
        }
    }

    Ok(())
}
