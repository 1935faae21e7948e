//! TLS configuration for ESI connections.
//!
//! Loads root certificates from the OS store once and caches the resulting
//! rustls config; certificate store lookups can be slow on some platforms.

use crate::error::{Error, Result};
use rustls::ClientConfig;
use std::sync::{Arc, OnceLock};

static CLIENT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Follows the common pattern: respect a globally installed crypto
/// provider, otherwise fall back to aws-lc-rs without installing it.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Returns the shared rustls client config with native roots and ALPN `h2`.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if no usable root certificates are
/// available, so TLS misconfiguration fails at connect time with a clear
/// message instead of an opaque handshake error.
pub(crate) fn client_config() -> Result<Arc<ClientConfig>> {
    if let Some(config) = CLIENT_CONFIG.get() {
        return Ok(config.clone());
    }

    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    if ignored > 0 {
        tracing::warn!(
            added,
            ignored,
            "some native root certificates could not be parsed"
        );
    }
    if added == 0 {
        return Err(Error::Configuration(
            "no usable native root CA certificates found".to_string(),
        ));
    }

    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Configuration(format!("failed to set TLS protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(CLIENT_CONFIG.get_or_init(|| Arc::new(config)).clone())
}
