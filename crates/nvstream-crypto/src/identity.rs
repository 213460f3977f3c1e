//! The long-lived client identity: an RSA-2048 keypair and a self-signed
//! certificate, generated on first use and shared by every subsystem for the
//! rest of the process lifetime.

use crate::pem::{certificate_signature_bytes, pem_to_der};
use nvstream_core::{CryptoError, Result};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

const CERT_FILE: &str = "client.pem";
const KEY_FILE: &str = "key.pem";
const KEY_BITS: usize = 2048;

static GLOBAL_IDENTITY: OnceLock<ClientIdentity> = OnceLock::new();

/// One identity per installation. Immutable after generation.
pub struct ClientIdentity {
    cert_pem: String,
    key_pem: zeroize::Zeroizing<String>,
    cert_der: Vec<u8>,
    cert_signature: Vec<u8>,
    signing_key: SigningKey<Sha256>,
}

impl ClientIdentity {
    /// Generate a fresh keypair and self-signed certificate in memory.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let key_pair = rcgen::KeyPair::from_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "NVIDIA GameStream Client");
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2049, 12, 31);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;

        Self::from_pems(cert.pem(), key_pem.to_string())
    }

    /// Build an identity from existing PEM material.
    pub fn from_pems(cert_pem: String, key_pem: String) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&key_pem)
            .map_err(|e| CryptoError::Certificate(format!("Unreadable private key: {}", e)))?;
        let cert_der = pem_to_der(&cert_pem)?;
        let cert_signature = certificate_signature_bytes(&cert_pem)?;

        Ok(Self {
            cert_pem,
            key_pem: zeroize::Zeroizing::new(key_pem),
            cert_der,
            cert_signature,
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    /// Load the identity from `dir`, generating and persisting a new one if
    /// none exists yet.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)
                .map_err(nvstream_core::PersistenceError::Io)?;
            let key_pem = fs::read_to_string(&key_path)
                .map_err(nvstream_core::PersistenceError::Io)?;
            return Self::from_pems(cert_pem, key_pem);
        }

        info!("No client identity found, generating a new keypair");
        let identity = Self::generate()?;
        fs::create_dir_all(dir).map_err(nvstream_core::PersistenceError::Io)?;
        fs::write(&cert_path, identity.certificate_pem())
            .map_err(nvstream_core::PersistenceError::Io)?;
        fs::write(&key_path, identity.private_key_pem())
            .map_err(nvstream_core::PersistenceError::Io)?;
        Ok(identity)
    }

    /// Initialize the process-wide identity. The first caller's directory
    /// wins; later calls return the already-initialized instance.
    pub fn init_global(dir: &Path) -> Result<&'static ClientIdentity> {
        if let Some(identity) = GLOBAL_IDENTITY.get() {
            return Ok(identity);
        }
        let identity = Self::load_or_generate(dir)?;
        Ok(GLOBAL_IDENTITY.get_or_init(|| identity))
    }

    /// The already-initialized process-wide identity, if any.
    pub fn global() -> Option<&'static ClientIdentity> {
        GLOBAL_IDENTITY.get()
    }

    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// PKCS#8 DER encoding of the private key, for TLS client authentication.
    pub fn private_key_der(&self) -> Result<Vec<u8>> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&self.key_pem)
            .map_err(|e| CryptoError::Certificate(format!("Unreadable private key: {}", e)))?;
        let der = private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(der.as_bytes().to_vec())
    }

    /// The certificate's signature field, hashed into the pairing transcript.
    pub fn certificate_signature(&self) -> &[u8] {
        &self.cert_signature
    }

    /// RSA PKCS#1 v1.5 signature over SHA-256 of `data`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_vec()
    }
}
