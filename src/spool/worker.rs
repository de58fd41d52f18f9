use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Spool;
use crate::mail;
use crate::mailbox::MailboxOperations;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Periodically drains the spool, grounded on the same sleep/select idiom
/// used for the token refresh loop (§4.6).
pub struct SpoolWorker {
    spool: Arc<Spool>,
    mailbox_ops: Arc<MailboxOperations>,
    attachment_limit_bytes: u64,
    interval: Duration,
}

impl SpoolWorker {
    pub fn new(
        spool: Arc<Spool>,
        mailbox_ops: Arc<MailboxOperations>,
        attachment_limit_bytes: u64,
    ) -> Self {
        Self {
            spool,
            mailbox_ops,
            attachment_limit_bytes,
            interval: DEFAULT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            if let Err(err) = self.drain_once().await {
                error!("spool drain pass failed: {err}");
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Runs a single pass over the spool in FIFO order, per §4.6: on success
    /// delete both files, on failure leave both and continue.
    pub async fn drain_once(&self) -> Result<(), super::SpoolError> {
        let pending = self.spool.pending()?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!("draining {} spooled message(s)", pending.len());

        for entry in pending {
            let outcome = self.deliver(&entry).await;
            match outcome {
                Ok(true) => {
                    if let Err(err) = entry.remove() {
                        error!("failed to remove drained spool entry {}: {err}", entry.stem);
                    } else {
                        info!("delivered spooled message {}", entry.stem);
                    }
                }
                Ok(false) => {
                    debug!("spooled message {} still undeliverable, leaving in place", entry.stem);
                }
                Err(err) => {
                    error!("error delivering spooled message {}: {err}", entry.stem);
                }
            }
        }

        Ok(())
    }

    async fn deliver(&self, entry: &super::SpoolEntry) -> Result<bool, crate::error::ProxyError> {
        let message = match mail::parse(&entry.raw_bytes) {
            Ok(message) => message,
            Err(_) => {
                error!("spooled message {} is not parseable, leaving in place", entry.stem);
                return Ok(false);
            }
        };

        let translated = match mail::translate(&message, &entry.rcpt_tos, self.attachment_limit_bytes)
        {
            Ok(translated) => translated,
            Err(_) => {
                error!(
                    "spooled message {} no longer translates, leaving in place",
                    entry.stem
                );
                return Ok(false);
            }
        };

        self.mailbox_ops
            .send(
                &entry.mail_from,
                &entry.mail_from,
                &entry.rcpt_tos,
                &entry.raw_bytes,
                &translated,
            )
            .await
    }
}
