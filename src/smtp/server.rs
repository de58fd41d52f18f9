use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::config::Config;
use crate::credentials::CredentialVerifier;
use crate::mailbox::MailboxOperations;
use crate::net_stream::MaybeTlsStream;
use crate::smtp::connection::{self, ConnectionError};
use crate::tls::{self, TlsConfigError, TlsMaterial};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to configure TLS: {0}")]
    Tls(#[from] TlsConfigError),
    #[error("failed to listen on {0}")]
    Listen(io::Error),
}

/// Whether a listener speaks SMTP in the clear (optionally offering
/// STARTTLS) or only ever accepts already-encrypted connections.
pub enum Mode {
    Plain { starttls: Option<TlsMaterial> },
    ImplicitTls { tls: TlsMaterial },
}

pub struct SmtpServer {
    bind_addr: SocketAddr,
    mode: Mode,
    server_name: String,
    config: Arc<Config>,
    credentials: Arc<CredentialVerifier>,
    mailbox_ops: Arc<MailboxOperations>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(
        bind_addr: SocketAddr,
        mode: Mode,
        server_name: String,
        config: Arc<Config>,
        credentials: Arc<CredentialVerifier>,
        mailbox_ops: Arc<MailboxOperations>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bind_addr,
            mode,
            server_name,
            config,
            credentials,
            mailbox_ops,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        let (acceptor, implicit_tls) = match &self.mode {
            Mode::Plain { starttls: Some(material) } => {
                let acceptor = Arc::new(RwLock::new(tls::build_acceptor(material)?));
                tls::spawn_cert_reload(acceptor.clone(), material.clone());
                (Some(acceptor), false)
            }
            Mode::Plain { starttls: None } => (None, false),
            Mode::ImplicitTls { tls: material } => {
                let acceptor = Arc::new(RwLock::new(tls::build_acceptor(material)?));
                tls::spawn_cert_reload(acceptor.clone(), material.clone());
                (Some(acceptor), true)
            }
        };

        info!(implicit_tls, "smtp server listening on {}", self.bind_addr);

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp listener on {}", self.bind_addr);
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        trace!(source = %peer_addr, "new smtp connection");
                        let acceptor = acceptor.clone();
                        let server_name = self.server_name.clone();
                        let config = self.config.clone();
                        let credentials = self.credentials.clone();
                        let mailbox_ops = self.mailbox_ops.clone();

                        tokio::spawn(async move {
                            let run = async {
                                let stream = if implicit_tls {
                                    let acceptor = acceptor.as_ref().expect("implicit TLS configured above");
                                    let tls_stream = acceptor
                                        .read()
                                        .await
                                        .accept(stream)
                                        .await
                                        .map_err(ConnectionError::TlsAccept)?;
                                    MaybeTlsStream::Tls(Box::new(tls_stream))
                                } else {
                                    MaybeTlsStream::Plain(stream)
                                };

                                let starttls_acceptor = if implicit_tls { None } else { acceptor };

                                connection::handle(
                                    stream,
                                    peer_addr,
                                    &server_name,
                                    config,
                                    credentials,
                                    mailbox_ops,
                                    starttls_acceptor,
                                )
                                .await
                            };

                            if let Err(err) = run.await {
                                match &err {
                                    ConnectionError::Read(e) | ConnectionError::TlsAccept(e)
                                        if e.kind() == io::ErrorKind::UnexpectedEof
                                            || e.kind() == io::ErrorKind::ConnectionReset =>
                                    {
                                        trace!("connection ended early: {err}");
                                    }
                                    _ => error!("failed to handle smtp connection: {err}"),
                                }
                            }
                        });
                    }
                    Err(err) => error!("failed to accept smtp connection: {err}"),
                },
            }
        }
    }
}
