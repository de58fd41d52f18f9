use std::fs::File;
use std::io;
use std::sync::Arc;

use rand::random_range;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tracing::info;

/// Cert/key paths shared by the SMTP and POP3 front-ends, loaded once from
/// `Config::tls`.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

fn load_cert_and_key(
    material: &TlsMaterial,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsConfigError> {
    let mut cert_reader =
        io::BufReader::new(File::open(&material.cert_file).map_err(TlsConfigError::Certificate)?);
    let mut key_reader =
        io::BufReader::new(File::open(&material.key_file).map_err(TlsConfigError::PrivateKey)?);

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(TlsConfigError::Certificate)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(TlsConfigError::PrivateKey)?
        .ok_or(TlsConfigError::PrivateKeyNotFound)?;

    Ok((certs, key))
}

pub fn build_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, TlsConfigError> {
    let (certs, key) = load_cert_and_key(material)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsConfigError::Tls)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Reloads the certificate roughly once a day (jittered, per the teacher's
/// own cadence) so a renewed cert on disk is picked up without a restart.
pub fn spawn_cert_reload(acceptor: Arc<RwLock<TlsAcceptor>>, material: TlsMaterial) {
    let interval = std::time::Duration::from_secs(60 * 60 * 23 + random_range(0..(60 * 60)));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match build_acceptor(&material) {
                Ok(new_acceptor) => {
                    *acceptor.write().await = new_acceptor;
                    info!("reloaded TLS certificate");
                }
                Err(err) => {
                    tracing::error!("failed to reload TLS certificate: {err}");
                }
            }
        }
    });
}
