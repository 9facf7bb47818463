//! Connection resilience layer.
//!
//! Builds pooled Postgres connections for source and target, negotiating SSL
//! per host: hosted instances require TLS, local development stacks reject it.
//! The negotiated preference is cached per hostname for the rest of the run so
//! every later pool to the same host skips the failed attempt.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rustls::ClientConfig;
use tokio_postgres::config::Host;
use tokio_postgres::Config as PgConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Bounded pool size per database (the pipeline is sequential; a handful of
/// connections covers truncation walks and count checks).
pub const POOL_SIZE: usize = 5;

/// Process-lifetime cache of hosts known to reject SSL.
///
/// Owned by the resilience layer and passed by reference; mutated at most once
/// per host per run, when an SSL attempt fails with an SSL-class error.
#[derive(Debug, Default)]
pub struct SslPreferences {
    no_ssl: Mutex<HashSet<String>>,
}

impl SslPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether SSL is known to be unsupported for this host.
    pub fn ssl_disabled(&self, host: &str) -> bool {
        self.no_ssl.lock().expect("ssl preference lock poisoned").contains(host)
    }

    /// Record that this host rejects SSL.
    pub fn disable_ssl(&self, host: &str) {
        self.no_ssl
            .lock()
            .expect("ssl preference lock poisoned")
            .insert(host.to_string());
    }
}

/// Whether a host is a recognized loopback address (SSL is never attempted).
pub fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}

/// Whether an error carries an SSL/TLS signature (as opposed to auth,
/// resolution, refusal or timeout).
pub fn is_ssl_error(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("ssl") || m.contains("tls") || m.contains("handshake") || m.contains("certificate")
}

/// Classify a connection-phase error into the fixed taxonomy.
pub fn classify_connect_error(step: &str, e: &tokio_postgres::Error) -> SyncError {
    if let Some(db) = e.as_db_error() {
        let code = db.code().code();
        if code.starts_with("28") {
            return SyncError::authentication(step, db.message());
        }
        if code == "42501" {
            return SyncError::permission(step, db.message());
        }
    }
    let message = e.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        SyncError::timeout(step, message)
    } else {
        SyncError::connection(step, message)
    }
}

/// Extract the first TCP hostname from a parsed connection config.
fn first_host(config: &PgConfig) -> String {
    config
        .get_hosts()
        .iter()
        .find_map(|h| match h {
            Host::Tcp(name) => Some(name.clone()),
            #[cfg(unix)]
            Host::Unix(_) => None,
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// Build a pooled connection for a connection string, negotiating SSL.
///
/// Protocol: attempt SSL unless the host is loopback or a previous attempt in
/// this run already failed; on an SSL-class failure, record the preference and
/// retry exactly once without SSL. Any other failure is classified and
/// propagated without retry.
pub async fn build_pool(
    step: &str,
    label: &str,
    db_url: &str,
    prefs: &SslPreferences,
) -> Result<Pool> {
    let pg_config: PgConfig = db_url
        .parse()
        .map_err(|e| SyncError::validation(step, format!("{label} db_url: {e}")))?;
    let host = first_host(&pg_config);

    let try_ssl = !is_loopback_host(&host) && !prefs.ssl_disabled(&host);

    if try_ssl {
        match build_and_probe(&pg_config, true).await {
            Ok(pool) => {
                info!("{label}: connected to {host} with SSL");
                return Ok(pool);
            }
            Err(ProbeError::Backend(e)) if is_ssl_error(&e.to_string()) => {
                warn!("{label}: SSL rejected by {host}, retrying without SSL");
                prefs.disable_ssl(&host);
            }
            Err(e) => return Err(e.classify(step)),
        }
    } else {
        debug!("{label}: skipping SSL for {host}");
    }

    match build_and_probe(&pg_config, false).await {
        Ok(pool) => {
            info!("{label}: connected to {host} without SSL");
            Ok(pool)
        }
        Err(e) => Err(e.classify(step)),
    }
}

/// Connection-probe failure: either a backend error we can classify precisely
/// or a pool-machinery error carried as text.
enum ProbeError {
    Backend(tokio_postgres::Error),
    Pool(String),
}

impl ProbeError {
    fn classify(self, step: &str) -> SyncError {
        match self {
            ProbeError::Backend(e) => classify_connect_error(step, &e),
            ProbeError::Pool(message) => SyncError::connection(step, message),
        }
    }
}

/// Build a pool and validate it with a probe query.
async fn build_and_probe(pg_config: &PgConfig, ssl: bool) -> std::result::Result<Pool, ProbeError> {
    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let pool = if ssl {
        let tls = MakeRustlsConnect::new(tls_client_config());
        let mgr = Manager::from_config(pg_config.clone(), tls, mgr_config);
        Pool::builder(mgr)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| ProbeError::Pool(e.to_string()))?
    } else {
        let mgr = Manager::from_config(pg_config.clone(), tokio_postgres::NoTls, mgr_config);
        Pool::builder(mgr)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| ProbeError::Pool(e.to_string()))?
    };

    let client = pool.get().await.map_err(|e| match e {
        deadpool_postgres::PoolError::Backend(b) => ProbeError::Backend(b),
        other => ProbeError::Pool(other.to_string()),
    })?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(ProbeError::Backend)?;
    drop(client);

    Ok(pool)
}

/// TLS config matching libpq's `sslmode=require`: encrypt the channel but do
/// not verify the server certificate. Hosted instances terminate TLS with
/// per-project certificates that are not in the public roots.
fn tls_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
}

/// Certificate verifier that accepts any certificate (sslmode=require).
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_hosts_recognized() {
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("LOCALHOST"));
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("127.1.2.3"));
        assert!(is_loopback_host("::1"));
        assert!(!is_loopback_host("db.example.com"));
        assert!(!is_loopback_host("10.0.0.1"));
    }

    #[test]
    fn ssl_error_signatures() {
        assert!(is_ssl_error("error performing TLS handshake"));
        assert!(is_ssl_error("server does not support SSL"));
        assert!(is_ssl_error("invalid peer certificate"));
        assert!(!is_ssl_error("password authentication failed"));
        assert!(!is_ssl_error("connection refused"));
    }

    #[test]
    fn ssl_preference_is_sticky() {
        let prefs = SslPreferences::new();
        assert!(!prefs.ssl_disabled("db.example.com"));
        prefs.disable_ssl("db.example.com");
        assert!(prefs.ssl_disabled("db.example.com"));
        assert!(!prefs.ssl_disabled("db.other.com"));
    }

    #[test]
    fn first_host_parses_url_form() {
        let cfg: PgConfig = "postgres://u:p@db.example.com:5432/postgres"
            .parse()
            .unwrap();
        assert_eq!(first_host(&cfg), "db.example.com");
    }
}
