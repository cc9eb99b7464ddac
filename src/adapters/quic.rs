/// [SECURITY] QUIC crypto configuration
///
/// Proof source (server certificate chain + key) and proof verifier (client
/// certificate policy), turned into quinn-proto endpoint configs.

use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn_proto::crypto::rustls::{QuicClientConfig as RustlsClientCrypto, QuicServerConfig as RustlsServerCrypto};
use quinn_proto::{ClientConfig, ServerConfig, TransportConfig, VarInt};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};

use crate::error::QuicError;
use crate::protocol::{QuicClientConfig, QuicServerConfig};

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// Custom verifier that skips server certificate verification
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
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
        rustls::crypto::verify_tls12_signature(
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
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, QuicError> {
    let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| QuicError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(QuicError::Certificate("No certificates found in PEM data".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, QuicError> {
    rustls_pemfile::private_key(&mut std::io::Cursor::new(pem))
        .map_err(|e| QuicError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| QuicError::Certificate("No private key found in PEM data".to_string()))
}

/// 服务端证书来源
#[derive(Debug)]
pub struct ProofSource {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for ProofSource {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl ProofSource {
    /// Load certificate chain and key from PEM files.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self, QuicError> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            QuicError::Certificate(format!("Failed to read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| {
            QuicError::Certificate(format!("Failed to read {}: {}", key_path.display(), e))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, QuicError> {
        Ok(Self {
            cert_chain: parse_certs(cert_pem)?,
            key: parse_key(key_pem)?,
        })
    }

    /// Self-signed certificate for the given names (development use).
    pub fn self_signed(names: &[&str]) -> Result<Self, QuicError> {
        let names = names.iter().map(|name| name.to_string()).collect::<Vec<_>>();
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| QuicError::Certificate(format!("Failed to generate certificate: {}", e)))?;
        tracing::debug!("[SECURITY] Generated self-signed certificate for QUIC server");
        Ok(Self {
            cert_chain: vec![certified.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der())),
        })
    }

    /// Resolve the proof source a server config describes: files, then PEM, then self-signed.
    pub fn from_config(config: &QuicServerConfig) -> Result<Self, QuicError> {
        if let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) {
            return Self::from_files(cert_path, key_path);
        }
        if let (Some(cert_pem), Some(key_pem)) = (&config.cert_pem, &config.key_pem) {
            return Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes());
        }
        Self::self_signed(&["localhost"])
    }

    /// First certificate of the chain, handy as a client trust anchor in tests.
    pub fn leaf_certificate(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    pub fn server_config(&self, config: &QuicServerConfig) -> Result<ServerConfig, QuicError> {
        let crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        let crypto = RustlsServerCrypto::try_from(crypto)
            .map_err(|e| QuicError::Config(format!("QUIC server crypto error: {}", e)))?;

        let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport_config(
            config.max_idle_timeout,
            config.max_concurrent_bidi_streams,
            config.max_concurrent_uni_streams,
        )?));
        Ok(server_config)
    }
}

/// 客户端证书校验策略
#[derive(Debug, Clone)]
pub enum ProofVerifier {
    /// 不校验证书（仅用于开发）
    Insecure,
    /// webpki 根证书
    WebPkiRoots,
    /// 自定义 CA
    CustomCa(Vec<CertificateDer<'static>>),
}

impl ProofVerifier {
    pub fn from_config(config: &QuicClientConfig) -> Result<Self, QuicError> {
        if !config.verify_certificate {
            return Ok(ProofVerifier::Insecure);
        }
        match &config.ca_cert_pem {
            Some(pem) => Ok(ProofVerifier::CustomCa(parse_certs(pem.as_bytes())?)),
            None => Ok(ProofVerifier::WebPkiRoots),
        }
    }

    pub fn client_config(&self, config: &QuicClientConfig) -> Result<ClientConfig, QuicError> {
        let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?;

        let crypto = match self {
            ProofVerifier::Insecure => {
                tracing::debug!("[SECURITY] QUIC client using insecure mode (skip certificate verification)");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(SkipServerVerification {
                        provider: crypto_provider(),
                    }))
                    .with_no_client_auth()
            }
            ProofVerifier::WebPkiRoots => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                tracing::debug!("[SECURITY] Using webpki root certificates for QUIC client verification");
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            ProofVerifier::CustomCa(certs) => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in certs {
                    roots.add(cert.clone())?;
                }
                tracing::debug!("[SECURITY] Using custom CA certificate for QUIC client verification");
                builder.with_root_certificates(roots).with_no_client_auth()
            }
        };

        let crypto = RustlsClientCrypto::try_from(crypto)
            .map_err(|e| QuicError::Config(format!("QUIC client crypto error: {}", e)))?;
        let mut client_config = ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(Arc::new(transport_config(
            config.max_idle_timeout,
            config.max_concurrent_bidi_streams,
            config.max_concurrent_uni_streams,
        )?));
        Ok(client_config)
    }
}

/// Transport parameters shared by both perspectives.
///
/// Keep-alive pings are driven by the session (only while streams are open),
/// so quinn-proto's own keep-alive stays disabled.
fn transport_config(
    max_idle_timeout: Duration,
    max_bidi_streams: u32,
    max_uni_streams: u32,
) -> Result<TransportConfig, QuicError> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        max_idle_timeout
            .try_into()
            .map_err(|e| QuicError::Config(format!("Invalid idle timeout: {}", e)))?,
    ));
    transport.keep_alive_interval(None);
    transport.max_concurrent_bidi_streams(VarInt::from_u32(max_bidi_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(max_uni_streams));
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_builds_server_config() {
        let source = ProofSource::self_signed(&["localhost"]).unwrap();
        assert!(source.server_config(&QuicServerConfig::default()).is_ok());
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let result = ProofSource::from_pem(b"not a certificate", b"not a key");
        assert!(matches!(result, Err(QuicError::Certificate(_))));
    }

    #[test]
    fn test_missing_cert_file_is_reported() {
        let result = ProofSource::from_files(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(result.is_err());
    }

    #[test]
    fn test_verifier_selection() {
        let insecure = ProofVerifier::from_config(&QuicClientConfig::default()).unwrap();
        assert!(matches!(insecure, ProofVerifier::Insecure));
        let roots = ProofVerifier::from_config(&QuicClientConfig::new().with_verify_certificate(true)).unwrap();
        assert!(matches!(roots, ProofVerifier::WebPkiRoots));
        assert!(insecure.client_config(&QuicClientConfig::default()).is_ok());
    }
}
