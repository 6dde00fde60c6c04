//! TLS identity and client certificate verification.
//!
//! [`TlsIdentity::load`] reads the server chain, its private key and the CA
//! bundle trusted for client certificates. The resulting
//! [`rustls::ServerConfig`] accepts handshakes without a client certificate
//! so public operations stay reachable; enforcement happens per operation in
//! the mutual-TLS stage, which verifies the captured chain through
//! [`WebPkiCertificateVerifier`].

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use ipamd_config::TlsConfig;
use ipamd_middleware::stages::{CertificateError, CertificateVerifier, VerifiedPeer};
use ipamd_middleware::{BoxFuture, ClientAuth};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::TlsError;

/// Paths of the PEM files making up the TLS identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Server certificate chain.
    pub cert_path: PathBuf,
    /// Server private key.
    pub key_path: PathBuf,
    /// CAs trusted to sign client certificates.
    pub ca_path: PathBuf,
}

impl TlsSettings {
    /// Creates settings from explicit paths.
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: ca_path.into(),
        }
    }

    /// Extracts the settings from the `[tls]` configuration section.
    ///
    /// # Errors
    ///
    /// [`TlsError::Disabled`] if TLS is off, [`TlsError::MissingPath`] if a
    /// path is unset.
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        if !config.enabled {
            return Err(TlsError::Disabled);
        }

        Ok(Self {
            cert_path: config
                .cert_path
                .clone()
                .ok_or(TlsError::MissingPath("cert_path"))?,
            key_path: config
                .key_path
                .clone()
                .ok_or(TlsError::MissingPath("key_path"))?,
            ca_path: config
                .ca_path
                .clone()
                .ok_or(TlsError::MissingPath("ca_path"))?,
        })
    }
}

/// A loaded TLS identity.
#[derive(Clone)]
pub struct TlsIdentity {
    server_config: Arc<ServerConfig>,
    verifier: Arc<WebPkiCertificateVerifier>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Loads the identity from PEM files.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if a file is unreadable or holds no usable
    /// material, or if rustls rejects the key pair.
    pub fn load(settings: &TlsSettings) -> Result<Self, TlsError> {
        let chain = load_cert_chain(&settings.cert_path)?;
        let key = load_private_key(&settings.key_path)?;
        let roots = load_root_store(&settings.ca_path)?;

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()?;

        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(Arc::clone(&client_verifier))
            .with_single_cert(chain, key)?;

        Ok(Self {
            server_config: Arc::new(server_config),
            verifier: Arc::new(WebPkiCertificateVerifier::new(client_verifier)),
        })
    }

    /// Loads the identity described by the `[tls]` section.
    ///
    /// # Errors
    ///
    /// See [`TlsSettings::from_config`] and [`TlsIdentity::load`].
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        Self::load(&TlsSettings::from_config(config)?)
    }

    /// Returns the rustls configuration for the transport listener.
    #[must_use]
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Returns the verifier for the mutual-TLS stage.
    #[must_use]
    pub fn certificate_verifier(&self) -> Arc<dyn CertificateVerifier> {
        self.verifier.clone()
    }

    /// Returns the pipeline's client authentication mode for this identity.
    #[must_use]
    pub fn client_auth(&self) -> ClientAuth {
        ClientAuth::Verify(self.certificate_verifier())
    }
}

/// Verifies client chains against the CA bundle with webpki.
///
/// Shares its trust anchors with the handshake verifier of the
/// [`TlsIdentity`] it came from.
pub struct WebPkiCertificateVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl std::fmt::Debug for WebPkiCertificateVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebPkiCertificateVerifier")
            .finish_non_exhaustive()
    }
}

impl WebPkiCertificateVerifier {
    /// Wraps a rustls client certificate verifier.
    #[must_use]
    pub fn new(inner: Arc<dyn ClientCertVerifier>) -> Self {
        Self { inner }
    }

    /// Builds a verifier trusting the CAs in `ca_path`.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if the bundle cannot be loaded.
    pub fn from_ca_file(ca_path: &Path) -> Result<Self, TlsError> {
        let roots = load_root_store(ca_path)?;
        let inner = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
        Ok(Self::new(inner))
    }

    /// Verifies `chain` (DER, leaf first) and extracts the peer identity.
    ///
    /// # Errors
    ///
    /// [`CertificateError::Missing`] for an empty chain,
    /// [`CertificateError::Malformed`] if the leaf does not parse and
    /// [`CertificateError::Untrusted`] if it does not chain to a trusted CA.
    pub fn verify_chain(&self, chain: &[Bytes]) -> Result<VerifiedPeer, CertificateError> {
        let (leaf, intermediates) = chain.split_first().ok_or(CertificateError::Missing)?;

        let peer = parse_peer(leaf)?;

        let end_entity = CertificateDer::from(&leaf[..]);
        let intermediates: Vec<CertificateDer<'_>> = intermediates
            .iter()
            .map(|cert| CertificateDer::from(&cert[..]))
            .collect();

        self.inner
            .verify_client_cert(&end_entity, &intermediates, UnixTime::now())
            .map_err(|e| CertificateError::Untrusted(e.to_string()))?;

        Ok(peer)
    }
}

impl CertificateVerifier for WebPkiCertificateVerifier {
    fn verify<'a>(
        &'a self,
        chain: &'a [Bytes],
    ) -> BoxFuture<'a, Result<VerifiedPeer, CertificateError>> {
        Box::pin(std::future::ready(self.verify_chain(chain)))
    }
}

/// Subject common name (or full subject) plus DNS, URI and e-mail SANs.
fn parse_peer(der: &[u8]) -> Result<VerifiedPeer, CertificateError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| CertificateError::Malformed(e.to_string()))?;

    let subject = cert
        .subject()
        .iter_common_name()
        .find_map(|name| name.as_str().ok().map(str::to_string))
        .unwrap_or_else(|| cert.subject().to_string());

    Ok(VerifiedPeer {
        subject,
        sans: subject_alt_names(&cert),
    })
}

fn subject_alt_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut sans = Vec::new();
    for extension in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
            for name in &san.general_names {
                let value = match name {
                    GeneralName::DNSName(value)
                    | GeneralName::URI(value)
                    | GeneralName::RFC822Name(value) => value.trim(),
                    _ => continue,
                };
                if !value.is_empty() {
                    sans.push(value.to_string());
                }
            }
        }
    }
    sans
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::read(path, e))?;
    let mut reader = BufReader::new(file);
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::read(path, e))?;

    if certificates.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::read(path, e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::read(path, e))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let certificates = load_cert_chain(path)?;
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certificates);
    if added == 0 {
        return Err(TlsError::NoTrustAnchors(path.to_path_buf()));
    }
    Ok(roots)
}
