//! rustls transport for broker connections
//!
//! Three setups are supported:
//! - `ca_cert` given: trust exactly the certificates in that PEM file
//! - `insecure = true`: encrypt but skip certificate verification
//! - neither: platform root store
//!
//! `protocol` pins the TLS version for the first two; the platform-root setup is
//! built by rumqttc and always negotiates.

use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};
use rumqttc::{TlsConfiguration, Transport};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::config::{TlsProtocol, TlsSettings};
use super::error::MqttError;

pub fn build_transport(settings: &TlsSettings) -> Result<Transport, MqttError> {
    let versions = protocol_versions(settings.protocol);

    if settings.insecure {
        warn!("TLS certificate verification disabled");
        let config = ClientConfig::builder_with_protocol_versions(versions)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        return Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(config),
        )));
    }

    match &settings.ca_cert {
        Some(path) => {
            let roots = load_roots(path)?;
            info!("Using CA certificates from {}", path.display());
            let config = ClientConfig::builder_with_protocol_versions(versions)
                .with_root_certificates(roots)
                .with_no_client_auth();
            Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(config),
            )))
        }
        None => {
            if settings.protocol.is_some() {
                warn!("TLS protocol pin ignored without ca_cert, using negotiated version");
            }
            Ok(Transport::tls_with_default_config())
        }
    }
}

static TLS12_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS12];
static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS13];

fn protocol_versions(protocol: Option<TlsProtocol>) -> &'static [&'static SupportedProtocolVersion] {
    match protocol {
        Some(TlsProtocol::Tls12) => &TLS12_ONLY,
        Some(TlsProtocol::Tls13) => &TLS13_ONLY,
        None => rustls::DEFAULT_VERSIONS,
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore, MqttError> {
    let file = File::open(path)
        .map_err(|e| MqttError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert
            .map_err(|e| MqttError::Tls(format!("invalid PEM in {}: {}", path.display(), e)))?;
        roots
            .add(cert)
            .map_err(|e| MqttError::Tls(format!("rejected certificate: {}", e)))?;
    }

    if roots.is_empty() {
        return Err(MqttError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

/// Accepts any server certificate (`insecure = true`)
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let settings = TlsSettings {
            ca_cert: Some("/nonexistent/ca.pem".into()),
            ..TlsSettings::default()
        };
        assert!(matches!(build_transport(&settings), Err(MqttError::Tls(_))));
    }

    #[test]
    fn empty_ca_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let settings = TlsSettings {
            ca_cert: Some(file.path().to_path_buf()),
            ..TlsSettings::default()
        };
        match build_transport(&settings) {
            Err(MqttError::Tls(reason)) => assert!(reason.contains("no certificates")),
            _ => panic!("expected TLS error"),
        }
    }

    #[test]
    fn insecure_transport_builds() {
        let settings = TlsSettings {
            insecure: true,
            protocol: Some(TlsProtocol::Tls12),
            ..TlsSettings::default()
        };
        assert!(matches!(build_transport(&settings), Ok(Transport::Tls(_))));
    }
}
