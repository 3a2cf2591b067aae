//! TLS for PostgreSQL connections, configured from descriptor parameters.
//!
//! - `ssl_mode`: `disable` (default), `require`, `verify-ca` or
//!   `verify-full`, with PostgreSQL's `sslmode` meaning.
//! - `ssl_root_cert`: path to a PEM bundle trusted in addition to the
//!   webpki roots. Only read by the verifying modes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ConfigBuilder, DigitallySignedStruct, RootCertStore,
    SignatureScheme, WantsVerifier,
};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::core::connection::ConnectionDescriptor;
use crate::error::{CloneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    /// Encrypt, accept any certificate.
    Require,
    /// Verify the chain, not the hostname.
    VerifyCa,
    /// Verify the chain and the hostname.
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "disable" | "" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(CloneError::Config(format!(
                "Invalid ssl_mode '{}'. Valid values: disable, require, verify-ca, verify-full",
                other
            ))),
        }
    }

    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    fn verifies(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

/// TLS settings of one connection.
#[derive(Debug, Clone, Default)]
pub struct TlsBuilder {
    ssl_mode: SslMode,
    root_cert: Option<PathBuf>,
}

impl TlsBuilder {
    pub fn new(ssl_mode: SslMode) -> Self {
        Self {
            ssl_mode,
            root_cert: None,
        }
    }

    /// Read `ssl_mode` and `ssl_root_cert` from the descriptor's extra parameters.
    pub fn from_descriptor(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let ssl_mode = SslMode::parse(descriptor.param("ssl_mode").unwrap_or("disable"))
            .map_err(|e| CloneError::Config(format!("{}: {}", descriptor.name, e)))?;
        let root_cert = descriptor.param("ssl_root_cert").map(PathBuf::from);
        if root_cert.is_some() && !ssl_mode.verifies() {
            warn!(
                connection = %descriptor.name,
                "ssl_root_cert is ignored unless ssl_mode is verify-ca or verify-full"
            );
        }
        Ok(Self { ssl_mode, root_cert })
    }

    pub fn with_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_cert = Some(path.into());
        self
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    /// The connector for deadpool-postgres, `None` when TLS is disabled.
    pub fn build(&self) -> Result<Option<MakeRustlsConnect>> {
        if !self.ssl_mode.requires_tls() {
            return Ok(None);
        }
        Ok(Some(MakeRustlsConnect::new(self.build_client_config()?)))
    }

    pub fn build_client_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = match self.ssl_mode {
            SslMode::Disable => {
                return Err(CloneError::Config(
                    "Cannot build TLS config for ssl_mode=disable".into(),
                ));
            }
            SslMode::Require => {
                warn!("ssl_mode=require does not verify the server certificate");
                builder(&provider)?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAny(Arc::clone(&provider))))
                    .with_no_client_auth()
            }
            SslMode::VerifyCa => {
                let inner = WebPkiServerVerifier::builder_with_provider(
                    Arc::new(self.root_store()?),
                    Arc::clone(&provider),
                )
                .build()
                .map_err(|e| CloneError::Config(format!("TLS setup failed: {}", e)))?;
                debug!("verifying server certificate chain only");
                builder(&provider)?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(ChainOnly(inner)))
                    .with_no_client_auth()
            }
            SslMode::VerifyFull => builder(&provider)?
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth(),
        };
        Ok(config)
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &self.root_cert {
            let (added, ignored) = store.add_parsable_certificates(read_pem(path)?);
            debug!(path = %path.display(), added, ignored, "Loaded root certificates");
            if added == 0 {
                return Err(CloneError::Config(format!(
                    "ssl_root_cert {} holds no usable certificate",
                    path.display()
                )));
            }
        }
        Ok(store)
    }
}

fn builder(provider: &Arc<CryptoProvider>) -> Result<ConfigBuilder<ClientConfig, WantsVerifier>> {
    ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| CloneError::Config(format!("TLS setup failed: {}", e)))
}

fn read_pem(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let invalid = |e: rustls::pki_types::pem::Error| {
        CloneError::Config(format!("ssl_root_cert {}: {}", path.display(), e))
    };
    CertificateDer::pem_file_iter(path)
        .map_err(invalid)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(invalid)
}

fn is_name_mismatch(e: &rustls::Error) -> bool {
    matches!(
        e,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

/// `ssl_mode=require`: any certificate, signatures still checked.
#[derive(Debug)]
struct AcceptAny(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAny {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// `ssl_mode=verify-ca`: webpki verification with hostname mismatches allowed.
#[derive(Debug)]
struct ChainOnly(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for ChainOnly {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .0
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(e) if is_name_mismatch(&e) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}
