use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tracing::{info, trace};

use crate::credentials::CredentialVerifier;
use crate::mailbox::MailboxOperations;
use crate::net_stream::MaybeTlsStream;
use crate::pop3::session::{PopReply, Pop3Session, parse_command};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept TLS connection: {0}")]
    TlsAccept(std::io::Error),
    #[error("failed to write to connection: {0}")]
    Write(std::io::Error),
    #[error("failed to read from connection: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
}

const MAX_LINE: usize = 4096;

pub async fn handle(
    stream: MaybeTlsStream<TcpStream>,
    peer_addr: SocketAddr,
    credentials: Arc<CredentialVerifier>,
    mailbox_ops: Arc<MailboxOperations>,
    stls_acceptor: Option<Arc<RwLock<TlsAcceptor>>>,
) -> Result<(), ConnectionError> {
    let tls_active = stream.is_tls();
    let stls_available = stls_acceptor.is_some() && !tls_active;

    let mut session = Pop3Session::new(peer_addr, credentials, mailbox_ops, tls_active, stls_available);
    let mut reader = BufReader::new(stream);

    trace!("handling pop3 connection with {}", session.peer());
    write_line(&mut reader, "+OK mailproxy POP3 server ready").await?;

    loop {
        let line = read_line(&mut reader).await?;

        let reply = if session.is_awaiting_auth_continuation() {
            session.handle_auth_continuation(&line).await
        } else {
            session.handle(parse_command(&line)).await
        };

        match reply {
            PopReply::Single(line) => write_line(&mut reader, &line).await?,
            PopReply::Multi(lines) => {
                for line in lines {
                    write_line(&mut reader, &line).await?;
                }
            }
            PopReply::AuthContinuation(line) => write_line(&mut reader, &line).await?,
            PopReply::StartTls(line) => {
                write_line(&mut reader, &line).await?;
                let acceptor = stls_acceptor
                    .as_ref()
                    .expect("StartTls reply only issued when an acceptor is configured");
                let plain = reader.into_inner();
                let upgraded = plain
                    .upgrade(&*acceptor.read().await)
                    .await
                    .map_err(ConnectionError::TlsAccept)?;
                reader = BufReader::new(upgraded);
                session.mark_tls_active();
            }
            PopReply::Stop(line) => {
                write_line(&mut reader, &line).await?;
                break;
            }
        }
    }

    info!("pop3 connection handled");
    Ok(())
}

async fn read_line(
    reader: &mut (impl AsyncBufReadExt + Unpin),
) -> Result<String, ConnectionError> {
    let mut buffer = Vec::with_capacity(256);
    let size = reader
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut buffer)
        .await
        .map_err(ConnectionError::Read)?;

    if size == 0 {
        return Err(ConnectionError::Dropped);
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn write_line(
    mut sink: impl AsyncWriteExt + Unpin,
    line: &str,
) -> Result<(), ConnectionError> {
    sink.write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;
    Ok(())
}
