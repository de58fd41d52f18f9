use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::credentials::CredentialVerifier;
use crate::mailbox::MailboxOperations;
use crate::pop3::{Mode as Pop3Mode, Pop3Server};
use crate::smtp::{Mode as SmtpMode, SmtpServer};
use crate::spool::{Spool, SpoolWorker};
use crate::tls::TlsMaterial;
use crate::token::TokenManager;
use crate::upstream::{ReqwestTransport, UpstreamAdapter};

const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Wires together every component described in §4.10: the Token Manager's
/// refresh loop, the Spool Worker, and one listener task per configured
/// port, all sharing a single shutdown signal.
pub struct Supervisor {
    config: Arc<Config>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config: Arc::new(config) }
    }

    fn tls_material(&self) -> Option<TlsMaterial> {
        self.config.tls.as_ref().map(|tls| TlsMaterial {
            cert_file: tls.tls_cert.to_string_lossy().into_owned(),
            key_file: tls.tls_key.to_string_lossy().into_owned(),
        })
    }

    fn bind_addr(&self, port: u16) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{port}", self.config.bind).parse()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let store = crate::token::TokenStore::new(&self.config.token_path, &self.config.client_id);
        let token_manager = Arc::new(TokenManager::new(
            self.config.client_id.clone(),
            self.config.tenant_id.clone(),
            store,
        ));

        if !token_manager.has_bundle() {
            info!("no stored token bundle found, starting interactive device-code login");
            token_manager.login_interactive().await?;
        }

        let transport = Arc::new(ReqwestTransport::new(
            GRAPH_BASE_URL.to_string(),
            self.config.effective_https_proxy().as_deref(),
        )?);
        let adapter = Arc::new(UpstreamAdapter::new(transport, token_manager.clone()));

        let credentials = Arc::new(CredentialVerifier::new(&self.config.mailboxes));
        let spool = Arc::new(Spool::new(&self.config.queue_dir)?);
        let mailbox_ops = Arc::new(MailboxOperations::new(adapter.clone(), spool.clone()));

        let shutdown = CancellationToken::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        handles.push(tokio::spawn(
            token_manager
                .clone()
                .run_refresh_loop(adapter.clone(), shutdown.clone()),
        ));

        let spool_worker = SpoolWorker::new(
            spool.clone(),
            mailbox_ops.clone(),
            self.config.attachment_limit_mb * 1024 * 1024,
        );
        handles.push(tokio::spawn(spool_worker.run(shutdown.clone())));

        if let Some(port) = self.config.smtp_port {
            let server = SmtpServer::new(
                self.bind_addr(port)?,
                SmtpMode::Plain { starttls: self.tls_material() },
                "mailproxy".to_string(),
                self.config.clone(),
                credentials.clone(),
                mailbox_ops.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(async move {
                if let Err(err) = server.serve().await {
                    warn!("smtp server exited: {err}");
                }
            }));
        }

        if let Some(port) = self.config.smtps_port {
            let tls = self.tls_material().expect("validated by Config::validate");
            let server = SmtpServer::new(
                self.bind_addr(port)?,
                SmtpMode::ImplicitTls { tls },
                "mailproxy".to_string(),
                self.config.clone(),
                credentials.clone(),
                mailbox_ops.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(async move {
                if let Err(err) = server.serve().await {
                    warn!("smtps server exited: {err}");
                }
            }));
        }

        if let Some(port) = self.config.pop3_port {
            let server = Pop3Server::new(
                self.bind_addr(port)?,
                Pop3Mode::Plain { stls: self.tls_material() },
                credentials.clone(),
                mailbox_ops.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(async move {
                if let Err(err) = server.serve().await {
                    warn!("pop3 server exited: {err}");
                }
            }));
        }

        if let Some(port) = self.config.pop3s_port {
            let tls = self.tls_material().expect("validated by Config::validate");
            let server = Pop3Server::new(
                self.bind_addr(port)?,
                Pop3Mode::ImplicitTls { tls },
                credentials.clone(),
                mailbox_ops.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(async move {
                if let Err(err) = server.serve().await {
                    warn!("pop3s server exited: {err}");
                }
            }));
        }

        crate::shutdown_signal(shutdown.clone()).await;
        info!("shutdown requested, waiting up to {:?} for tasks to finish", SHUTDOWN_GRACE_PERIOD);
        shutdown.cancel();

        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, join_all).await.is_err() {
            warn!("shutdown grace period elapsed, exiting anyway");
        }

        Ok(())
    }
}
