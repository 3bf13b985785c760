//! rustls configuration for both sides of the proxy.
//!
//! The accept side serves the configured key and cert, with client
//! certificate verification layered on for the `verify-ca`/`verify-full`
//! modes. The dial side ladders up from no verification (`require` and
//! below, matching libpq), through chain-only verification (`verify-ca`),
//! to full verification with hostname checking (`verify-full`).
use std::{io, path::Path, sync::Arc};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{TlsMode, TlsSettings};

/// Error preparing or negotiating TLS.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {err}")]
    ReadFile { path: String, err: io::Error },
    #[error("no certificate found in {0}")]
    NoCert(String),
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("tls enabled but {0} is not configured")]
    Missing(&'static str),
    #[error("tls is required but the server refused it")]
    Refused,
    #[error("invalid tls server name {0:?}")]
    InvalidName(String),
    #[error("invalid verifier configuration: {0}")]
    Verifier(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Build the acceptor serving client-side TLS.
pub fn acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, TlsError> {
    let cert_file = settings.cert_file.as_deref().ok_or(TlsError::Missing("cert file"))?;
    let key_file = settings.key_file.as_deref().ok_or(TlsError::Missing("key file"))?;
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let builder = ServerConfig::builder();
    let config = if settings.mode.verifies() {
        let ca_file = settings.ca_file.as_deref().ok_or(TlsError::Missing("ca file"))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots.add(cert)?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the connector dialing backend-side TLS.
pub fn connector(settings: &TlsSettings) -> Result<TlsConnector, TlsError> {
    let builder = ClientConfig::builder();
    let wants_cert = match settings.mode {
        TlsMode::VerifyFull => builder.with_root_certificates(root_store(settings)?),
        TlsMode::VerifyCa => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verify::CaOnly::new(root_store(settings)?)?)),
        _ => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verify::NoVerification)),
    };

    let config = match (&settings.cert_file, &settings.key_file) {
        (Some(cert), Some(key)) => {
            wants_cert.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?
        }
        _ => wants_cert.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn root_store(settings: &TlsSettings) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca) = settings.ca_file.as_deref() {
        for cert in load_certs(ca)? {
            roots.add(cert)?;
        }
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = std::fs::read(path).map_err(|err| TlsError::ReadFile {
        path: path.display().to_string(),
        err,
    })?;
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(&pem[..]))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::ReadFile { path: path.display().to_string(), err })?;
    if certs.is_empty() {
        return Err(TlsError::NoCert(path.display().to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = std::fs::read(path).map_err(|err| TlsError::ReadFile {
        path: path.display().to_string(),
        err,
    })?;
    rustls_pemfile::private_key(&mut io::BufReader::new(&pem[..]))
        .map_err(|err| TlsError::ReadFile { path: path.display().to_string(), err })?
        .ok_or_else(|| TlsError::NoKey(path.display().to_string()))
}

mod verify {
    use std::sync::Arc;

    use rustls::{
        CertificateError, DigitallySignedStruct, Error, RootCertStore, SignatureScheme,
        client::{
            WebPkiServerVerifier,
            danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        },
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    /// Accepts any server certificate. Used for `allow`/`prefer`/`require`,
    /// where libpq semantics only ask for encryption, not identity.
    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    /// Verifies the certificate chain against the roots but tolerates a
    /// hostname mismatch, the `verify-ca` contract.
    #[derive(Debug)]
    pub(super) struct CaOnly {
        inner: Arc<WebPkiServerVerifier>,
    }

    impl CaOnly {
        pub(super) fn new(roots: RootCertStore) -> Result<Self, super::TlsError> {
            let inner = WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| super::TlsError::Verifier(e.to_string()))?;
            Ok(Self { inner })
        }
    }

    impl ServerCertVerifier for CaOnly {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                    Ok(ServerCertVerified::assertion())
                }
                Err(Error::InvalidCertificate(CertificateError::NotValidForNameContext {
                    ..
                })) => Ok(ServerCertVerified::assertion()),
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            self.inner.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            self.inner.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.inner.supported_verify_schemes()
        }
    }
}
