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

use crate::credentials::CredentialVerifier;
use crate::mailbox::MailboxOperations;
use crate::net_stream::MaybeTlsStream;
use crate::pop3::connection::{self, ConnectionError};
use crate::tls::{self, TlsConfigError, TlsMaterial};

#[derive(Debug, Error)]
pub enum Pop3ServerError {
    #[error("failed to configure TLS: {0}")]
    Tls(#[from] TlsConfigError),
    #[error("failed to listen on {0}")]
    Listen(io::Error),
}

pub enum Mode {
    Plain { stls: Option<TlsMaterial> },
    ImplicitTls { tls: TlsMaterial },
}

pub struct Pop3Server {
    bind_addr: SocketAddr,
    mode: Mode,
    credentials: Arc<CredentialVerifier>,
    mailbox_ops: Arc<MailboxOperations>,
    shutdown: CancellationToken,
}

impl Pop3Server {
    pub fn new(
        bind_addr: SocketAddr,
        mode: Mode,
        credentials: Arc<CredentialVerifier>,
        mailbox_ops: Arc<MailboxOperations>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bind_addr,
            mode,
            credentials,
            mailbox_ops,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), Pop3ServerError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(Pop3ServerError::Listen)?;

        let (acceptor, implicit_tls) = match &self.mode {
            Mode::Plain { stls: Some(material) } => {
                let acceptor = Arc::new(RwLock::new(tls::build_acceptor(material)?));
                tls::spawn_cert_reload(acceptor.clone(), material.clone());
                (Some(acceptor), false)
            }
            Mode::Plain { stls: None } => (None, false),
            Mode::ImplicitTls { tls: material } => {
                let acceptor = Arc::new(RwLock::new(tls::build_acceptor(material)?));
                tls::spawn_cert_reload(acceptor.clone(), material.clone());
                (Some(acceptor), true)
            }
        };

        info!(implicit_tls, "pop3 server listening on {}", self.bind_addr);

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down pop3 listener on {}", self.bind_addr);
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        trace!(source = %peer_addr, "new pop3 connection");
                        let acceptor = acceptor.clone();
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

                                let stls_acceptor = if implicit_tls { None } else { acceptor };

                                connection::handle(stream, peer_addr, credentials, mailbox_ops, stls_acceptor)
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
                                    _ => error!("failed to handle pop3 connection: {err}"),
                                }
                            }
                        });
                    }
                    Err(err) => error!("failed to accept pop3 connection: {err}"),
                },
            }
        }
    }
}
