//! TLS client policy for the control channel.

use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc};

use backend_core::{BackendError, BackendErrorCategory};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio_rustls::TlsConnector;
use tracing::warn;

/// Certificate policy for one server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Skip certificate verification entirely. Off unless configured;
    /// self-signed servers should prefer `ca_file`.
    pub accept_invalid_certs: bool,
    /// Extra PEM trust anchors added to the bundled web roots.
    pub ca_file: Option<PathBuf>,
}

/// Build a connector for `options`.
pub fn build_connector(options: &TlsOptions) -> Result<TlsConnector, BackendError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| config_error("tls_config_invalid", err.to_string()))?;

    let config = if options.accept_invalid_certs {
        warn!("TLS certificate verification is disabled for this connection");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store(options)?)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Validate a host name for SNI and certificate matching.
pub fn server_name(host: &str) -> Result<ServerName<'static>, BackendError> {
    ServerName::try_from(host.to_owned())
        .map_err(|err| config_error("invalid_server_name", format!("{host}: {err}")))
}

fn root_store(options: &TlsOptions) -> Result<RootCertStore, BackendError> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    if let Some(path) = &options.ca_file {
        let file = File::open(path).map_err(|err| {
            config_error("ca_file_unreadable", format!("{}: {err}", path.display()))
        })?;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert = cert.map_err(|err| {
                config_error("ca_file_invalid", format!("{}: {err}", path.display()))
            })?;
            roots
                .add(cert)
                .map_err(|err| config_error("ca_file_invalid", err.to_string()))?;
        }
    }

    Ok(roots)
}

fn config_error(code: &str, message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCategory::Config, code, message)
}

/// Verifier used only when `accept_invalid_certs` is set: trusts any
/// certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_verifying_and_permissive_connectors() {
        assert!(build_connector(&TlsOptions::default()).is_ok());
        assert!(
            build_connector(&TlsOptions {
                accept_invalid_certs: true,
                ca_file: None,
            })
            .is_ok()
        );
    }

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let err = build_connector(&TlsOptions {
            accept_invalid_certs: false,
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
        })
        .err()
        .expect("missing file must fail");
        assert_eq!(err.category, BackendErrorCategory::Config);
        assert_eq!(err.code, "ca_file_unreadable");
    }

    #[test]
    fn validates_server_names() {
        assert!(server_name("voice.example.org").is_ok());
        assert!(server_name("10.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
