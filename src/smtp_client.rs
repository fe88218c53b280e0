//! Minimal SMTP client used to drive the server in tests.

use crate::smtp_server::Envelope;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpSocket;

/// Sends `envelope` to the SMTP server at `addr`.
pub async fn send(addr: SocketAddr, envelope: &Envelope) -> io::Result<()> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    // Disable Nagle's algorithm.
    socket.set_nodelay(true)?;

    let stream = socket.connect(addr).await?;

    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut response = String::new();

    macro_rules! cmd {
        ($command:expr, $context:expr, $expected_code:expr) => {
            cmd!(write $command);
            cmd!(read $context, $expected_code);
        };
        (write $command:expr) => {
            writer.write_all($command).await?;
            writer.flush().await?;
        };
        (read $context:expr, $expected_code:expr) => {
            reader.read_line(&mut response).await?;
            if !response.starts_with($expected_code) {
                return Err(io::Error::other(format!(
                    "unexpected answer to {}: {}",
                    $context,
                    response.trim_end()
                )));
            }
            response.clear();
        };
    }

    cmd!(read "initial greeting", "220");
    cmd!(b"HELO localhost\r\n", "HELO", "250");
    cmd!(
        format!("MAIL FROM:<{}>\r\n", envelope.mail_from).as_bytes(),
        "MAIL FROM",
        "250"
    );
    for rcpt in &envelope.rcpt_to {
        cmd!(
            format!("RCPT TO:<{}>\r\n", rcpt).as_bytes(),
            "RCPT TO",
            "250"
        );
    }

    cmd!(b"DATA\r\n", "DATA", "354");
    for line in envelope.data.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(b".") {
            cmd!(write b".");
        }
        cmd!(write line);
    }
    cmd!(write b".\r\n");
    cmd!(read "end of DATA", "250");
    cmd!(b"QUIT\r\n", "QUIT", "221");

    Ok(())
}
