use thiserror::Error;

/// The error taxonomy the front-ends match on to pick a protocol reply.
///
/// Every upstream-facing subsystem (`token`, `upstream`, `mail`, `mailbox`)
/// returns a more specific error; the front-ends narrow those down to one of
/// these kinds before turning them into an SMTP/POP3 reply code.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("authentication with the upstream API failed: {0}")]
    Auth(String),

    #[error("upstream call failed transiently: {0}")]
    UpstreamTransient(String),

    #[error("upstream call failed: {0}")]
    UpstreamPermanent(String),

    #[error("upstream reported a concurrent modification (412)")]
    ConcurrentModification,
}
