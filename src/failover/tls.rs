//! TLS plumbing for the QUIC channel.
//!
//! The server generates an ephemeral self-signed certificate at start
//! (24h validity, bound to 127.0.0.1) and the client skips verification
//! entirely; peers are expected to be reachable only over a private network.
//! TODO: accept an operator-provided certificate instead of the ephemeral
//! one.

use {
    super::PROTOCOL_ALPN,
    crate::error::{Error, Result},
    quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig},
    rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    std::{sync::Arc, time::Duration},
};

const CERT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the server-side QUIC crypto config around a fresh self-signed
/// certificate.
pub fn new_server_config() -> Result<quinn::ServerConfig> {
    let mut params = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()])
        .map_err(|err| Error::Configuration(format!("failed to build certificate params: {err}")))?;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + CERT_VALIDITY;

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|err| Error::Configuration(format!("failed to generate certificate key: {err}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|err| Error::Configuration(format!("failed to self-sign certificate: {err}")))?;

    let cert_chain = vec![CertificateDer::from(cert.der().to_vec())];
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| Error::Configuration(format!("failed to build tls config: {err}")))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|err| Error::Configuration(format!("invalid server certificate: {err}")))?;
    server_crypto.alpn_protocols = vec![PROTOCOL_ALPN.to_vec()];

    let quic_config = QuicServerConfig::try_from(server_crypto)
        .map_err(|err| Error::Configuration(format!("failed to build quic server crypto: {err}")))?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(quic_config)))
}

/// Build the client-side QUIC crypto config: TLS 1.3, no certificate
/// verification, failover ALPN.
pub fn new_client_config() -> Result<quinn::ClientConfig> {
    let provider = crypto_provider();
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| Error::Configuration(format!("failed to build tls config: {err}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![PROTOCOL_ALPN.to_vec()];

    let quic_config = QuicClientConfig::try_from(client_crypto)
        .map_err(|err| Error::Configuration(format!("failed to build quic client crypto: {err}")))?;
    Ok(quinn::ClientConfig::new(Arc::new(quic_config)))
}

/// Accepts any server certificate. The channel stays encrypted; peer
/// authenticity relies on the private network and the gossip cross-checks.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
