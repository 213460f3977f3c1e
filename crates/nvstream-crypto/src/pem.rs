//! X.509 certificate handling: PEM decoding, signature-field extraction,
//! and RSA-SHA256 verification against a certificate's public key.

use nvstream_core::CryptoError;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha256;
use x509_parser::pem::parse_x509_pem;

/// Decode a PEM certificate to its DER bytes.
pub fn pem_to_der(cert_pem: &str) -> Result<Vec<u8>, CryptoError> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CryptoError::Certificate(format!("PEM decode failed: {}", e)))?;
    Ok(pem.contents)
}

/// Extract the certificate's signature field bytes. The pairing transcript
/// hashes these, for both the client and the host certificate.
pub fn certificate_signature_bytes(cert_pem: &str) -> Result<Vec<u8>, CryptoError> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CryptoError::Certificate(format!("PEM decode failed: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CryptoError::Certificate(format!("X.509 parse failed: {}", e)))?;
    Ok(cert.signature_value.data.to_vec())
}

/// Verify an RSA PKCS#1 v1.5 SHA-256 signature over `data` using the public
/// key of the given PEM certificate. Returns false for bad signatures and
/// errors only for unusable certificates.
pub fn verify_rsa_sha256(cert_pem: &str, data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CryptoError::Certificate(format!("PEM decode failed: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CryptoError::Certificate(format!("X.509 parse failed: {}", e)))?;

    let spki = cert.public_key();
    let public_key = RsaPublicKey::from_pkcs1_der(&spki.subject_public_key.data)
        .map_err(|e| CryptoError::Certificate(format!("Unsupported public key: {}", e)))?;

    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signature = match Signature::try_from(signature) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };

    Ok(verifying_key.verify(data, &signature).is_ok())
}
