//! rustls setup for `wss://` connections.

use crate::connection::TlsClientConfig;
use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::Item;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

fn tls_err(what: &str, path: &Path, e: impl std::fmt::Display) -> ClientError {
    ClientError::TlsConfig(format!("{} {}: {}", what, path.display(), e))
}

/// Builds the rustls client configuration handed to the WebSocket connector.
///
/// Trust comes from `ca_cert_path` when set, the bundled webpki roots
/// otherwise. A client identity is presented only when both the
/// certificate and key paths are given.
pub fn create_client_config(config: &TlsClientConfig) -> Result<Arc<ClientConfig>, ClientError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::TlsConfig(format!("protocol versions: {}", e)))?;

    let builder = if config.insecure {
        tracing::warn!("Server certificates will not be verified");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
    } else {
        builder.with_root_certificates(trust_roots(config.ca_cert_path.as_deref())?)
    };

    let tls = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert), Some(key)) => {
            let (chain, _) = read_pem(cert)?;
            let (_, private_key) = read_pem(key)?;
            let private_key = private_key
                .ok_or_else(|| tls_err("no private key in", key, "empty"))?;
            builder
                .with_client_auth_cert(chain, private_key)
                .map_err(|e| ClientError::TlsConfig(format!("client identity: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(tls))
}

fn trust_roots(ca: Option<&Path>) -> Result<RootCertStore, ClientError> {
    let mut roots = RootCertStore::empty();
    let Some(path) = ca else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };

    let (certs, _) = read_pem(path)?;
    if certs.is_empty() {
        return Err(tls_err("no certificates in", path, "empty"));
    }
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(tls_err("no usable CA certificate in", path, "unparsable"));
    }
    if ignored > 0 {
        tracing::warn!("Ignored {} unparsable certificates in {}", ignored, path.display());
    }
    Ok(roots)
}

/// Reads every certificate and the first private key out of a PEM file.
fn read_pem(
    path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, Option<PrivateKeyDer<'static>>), ClientError> {
    let file = File::open(path).map_err(|e| tls_err("cannot open", path, e))?;
    let mut certs = Vec::new();
    let mut key = None;

    for item in rustls_pemfile::read_all(&mut BufReader::new(file)) {
        match item.map_err(|e| tls_err("malformed PEM in", path, e))? {
            Item::X509Certificate(cert) => certs.push(cert),
            Item::Pkcs8Key(k) if key.is_none() => key = Some(k.into()),
            Item::Pkcs1Key(k) if key.is_none() => key = Some(k.into()),
            Item::Sec1Key(k) if key.is_none() => key = Some(k.into()),
            _ => {}
        }
    }
    Ok((certs, key))
}

/// Verifier used with `insecure`: any chain is accepted, signatures are
/// still checked against the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
