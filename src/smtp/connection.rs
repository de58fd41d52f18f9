use std::net::SocketAddr;
use std::sync::Arc;

use smtp_proto::Request;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::credentials::CredentialVerifier;
use crate::mailbox::MailboxOperations;
use crate::net_stream::MaybeTlsStream;
use crate::smtp::session::{DataReply, SessionReply, SmtpSession};

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

const BUFFER_SIZE: usize = 4096;
const CODE_READY: u16 = 220;

pub async fn handle(
    stream: MaybeTlsStream<TcpStream>,
    peer_addr: SocketAddr,
    server_name: &str,
    config: Arc<Config>,
    credentials: Arc<CredentialVerifier>,
    mailbox_ops: Arc<MailboxOperations>,
    starttls_acceptor: Option<Arc<RwLock<TlsAcceptor>>>,
) -> Result<(), ConnectionError> {
    let tls_active = stream.is_tls();
    let starttls_available = starttls_acceptor.is_some() && !tls_active;

    let mut session = SmtpSession::new(
        peer_addr,
        config,
        credentials,
        mailbox_ops,
        tls_active,
        starttls_available,
    );

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, stream);
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);

    trace!("handling connection with {}", session.peer());

    write_reply(CODE_READY, server_name, &mut reader).await?;

    'session: loop {
        if session.is_awaiting_auth_continuation() {
            read_line(&mut reader, &mut buffer).await?;
            match session.handle_auth_continuation(&mut buffer) {
                SessionReply::ReplyAndContinue(code, message) => {
                    write_reply(code, &message, &mut reader).await?;
                }
                SessionReply::IngestAuthContinuation(code, message) => {
                    write_reply(code, &message, &mut reader).await?;
                }
                _ => unreachable!("auth continuation only replies or asks for another line"),
            }
            continue 'session;
        }

        read_line(&mut reader, &mut buffer).await?;
        let request = Request::parse(&mut buffer.iter()).map(|r| r.into_owned());
        trace!("received request: {:?}", request);

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut reader).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut reader).await?;
                break 'session;
            }
            SessionReply::RawReply(buf) => {
                reader.write_all(&buf).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::IngestAuthContinuation(code, message) => {
                write_reply(code, &message, &mut reader).await?;
            }
            SessionReply::StartTls(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                let acceptor = starttls_acceptor
                    .as_ref()
                    .expect("StartTls reply only issued when an acceptor is configured");
                let plain = reader.into_inner();
                let upgraded = plain
                    .upgrade(&*acceptor.read().await)
                    .await
                    .map_err(ConnectionError::TlsAccept)?;
                reader = BufReader::with_capacity(BUFFER_SIZE, upgraded);
                session.mark_tls_active();
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                'data: loop {
                    read_buf(&mut reader, &mut buffer).await?;

                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue 'data,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut reader).await?;
                            continue 'session;
                        }
                    }
                }
            }
        }
    }

    info!("connection handled");
    Ok(())
}

async fn read_buf(
    reader: &mut (impl AsyncBufReadExt + Unpin),
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_buf(buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| if size > 0 { Ok(size) } else { Err(ConnectionError::Dropped) })
}

async fn read_line(
    reader: &mut (impl AsyncBufReadExt + Unpin),
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| if size > 0 { Ok(size) } else { Err(ConnectionError::Dropped) })
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
) -> Result<(), ConnectionError> {
    let n = sink
        .write(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    if n < 256 {
        debug!("sent: {} {}", code, message);
    } else {
        trace!("sent {} bytes", n);
    }

    Ok(())
}
