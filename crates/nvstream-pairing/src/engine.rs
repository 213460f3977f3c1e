//! The pairing handshake state machine.
//!
//! Four host round trips over HTTP plus a confirming HTTPS challenge
//! simultaneously prove knowledge of the user-entered PIN on both sides and
//! exchange long-lived certificate material. The engine is sans-IO: each
//! stage has a request builder producing query arguments and a response
//! processor consuming the host's XML, so the whole protocol is testable
//! against an in-process mock host.

use nvstream_core::{PairingError, Result};
use nvstream_crypto::{
    certificate_signature_bytes, derive_pairing_key, random_bytes, verify_rsa_sha256,
    Aes128EcbCipher, ClientIdentity, HashAlgorithm,
};
use nvstream_http::{xml_hex_bytes, xml_string};
use std::sync::Arc;
use tracing::warn;

/// Final result of a pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    /// Mutual authentication succeeded; the host certificate is now pinned.
    Paired { server_cert_pem: String },
    /// The host computed a different PIN transcript.
    PinWrong,
    /// Another client is mid-pairing with this host.
    AlreadyInProgress,
    /// Stage failure, MITM detection, or host rejection.
    Failed,
}

/// What a response processor decided: move to the next stage, or stop with
/// a final outcome.
#[derive(Debug)]
pub enum StageProgress {
    Continue,
    Terminal(PairOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    SaltSent,
    ChallengeReady,
    ChallengeSent,
    ChallengeResponseReady,
    ChallengeResponseSent,
    SecretReady,
    SecretSent,
    PairChallengeSent,
    Complete,
    Failed,
}

pub struct PairingEngine {
    state: State,
    identity: Arc<ClientIdentity>,
    algo: HashAlgorithm,
    cipher: Aes128EcbCipher,
    salt: [u8; 16],
    client_challenge: [u8; 16],
    client_secret: [u8; 16],
    server_cert_pem: Option<String>,
    server_challenge: Vec<u8>,
    server_response: Vec<u8>,
}

impl PairingEngine {
    /// Start a pairing attempt. The hash generation comes from the host's
    /// major app version; the AES key is derived from a fresh random salt
    /// and the user's PIN.
    pub fn new(identity: Arc<ClientIdentity>, server_major_version: i32, pin: &str) -> Self {
        let algo = HashAlgorithm::for_server_generation(server_major_version);

        let mut salt = [0u8; 16];
        salt.copy_from_slice(&random_bytes(16));
        let mut client_challenge = [0u8; 16];
        client_challenge.copy_from_slice(&random_bytes(16));
        let mut client_secret = [0u8; 16];
        client_secret.copy_from_slice(&random_bytes(16));

        let key = derive_pairing_key(algo, &salt, pin);

        Self {
            state: State::Initial,
            identity,
            algo,
            cipher: Aes128EcbCipher::new(key),
            salt,
            client_challenge,
            client_secret,
            server_cert_pem: None,
            server_challenge: Vec::new(),
            server_response: Vec::new(),
        }
    }

    /// The host certificate pinned during stage 1, once known.
    pub fn server_cert_pem(&self) -> Option<&str> {
        self.server_cert_pem.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    fn fail<T>(&mut self, err: PairingError) -> Result<T> {
        self.state = State::Failed;
        Err(err.into())
    }

    fn expect_state(&mut self, expected: State, what: &'static str) -> Result<()> {
        if self.state != expected {
            return self.fail(PairingError::InvalidState(what));
        }
        Ok(())
    }

    /// True when the response carries `<paired>1</paired>`.
    fn response_paired(xml: &str) -> bool {
        xml_string(xml, "paired").as_deref() == Some("1")
    }

    /// Stage 1 request: send our salt and certificate, ask for the host's.
    pub fn salt_request(&mut self) -> Result<String> {
        self.expect_state(State::Initial, "salt request must come first")?;
        let args = format!(
            "devicename=roth&updateState=1&phrase=getservercert&salt={}&clientcert={}",
            hex::encode(self.salt),
            hex::encode(self.identity.certificate_pem().as_bytes()),
        );
        self.state = State::SaltSent;
        Ok(args)
    }

    /// Stage 1 response: the host's plaintext certificate. An absent
    /// `plaincert` means another pairing attempt holds the host.
    pub fn process_salt_response(&mut self, xml: &str) -> Result<StageProgress> {
        self.expect_state(State::SaltSent, "salt response before salt request")?;

        if !Self::response_paired(xml) {
            warn!("Pairing failed at the get-server-cert stage");
            self.state = State::Failed;
            return Ok(StageProgress::Terminal(PairOutcome::Failed));
        }

        let cert_bytes = match xml_hex_bytes(xml, "plaincert") {
            Ok(Some(bytes)) if !bytes.is_empty() => bytes,
            Ok(_) => {
                warn!("Host did not return its certificate; another pairing is likely in progress");
                self.state = State::Failed;
                return Ok(StageProgress::Terminal(PairOutcome::AlreadyInProgress));
            }
            Err(e) => return self.fail(PairingError::Protocol(e.to_string())),
        };

        let cert_pem = match String::from_utf8(cert_bytes) {
            Ok(pem) => pem,
            Err(_) => return self.fail(PairingError::BadServerCert),
        };
        // Reject unparseable certificates now; later stages hash the
        // certificate's signature field.
        if certificate_signature_bytes(&cert_pem).is_err() {
            return self.fail(PairingError::BadServerCert);
        }

        self.server_cert_pem = Some(cert_pem);
        self.state = State::ChallengeReady;
        Ok(StageProgress::Continue)
    }

    /// Stage 2 request: our random challenge, encrypted under the PIN key.
    pub fn challenge_request(&mut self) -> Result<String> {
        self.expect_state(State::ChallengeReady, "challenge before server cert")?;
        let encrypted = self
            .cipher
            .encrypt(&self.client_challenge)
            .map_err(|e| PairingError::Protocol(e.to_string()))?;
        self.state = State::ChallengeSent;
        Ok(format!(
            "devicename=roth&updateState=1&clientchallenge={}",
            hex::encode(encrypted)
        ))
    }

    /// Stage 2 response: decrypt the host's combined response + challenge.
    pub fn process_challenge_response(&mut self, xml: &str) -> Result<StageProgress> {
        self.expect_state(State::ChallengeSent, "challenge response before challenge")?;

        if !Self::response_paired(xml) {
            warn!("Pairing failed at the challenge stage");
            self.state = State::Failed;
            return Ok(StageProgress::Terminal(PairOutcome::Failed));
        }

        let encrypted = match xml_hex_bytes(xml, "challengeresponse") {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.fail(PairingError::Protocol("missing challengeresponse".into())),
            Err(e) => return self.fail(PairingError::Protocol(e.to_string())),
        };
        let decrypted = match self.cipher.decrypt(&encrypted) {
            Ok(d) => d,
            Err(e) => return self.fail(PairingError::Protocol(e.to_string())),
        };

        let hash_len = self.algo.digest_len();
        if decrypted.len() < hash_len + 16 {
            return self.fail(PairingError::Protocol("challenge response too short".into()));
        }

        self.server_response = decrypted[..hash_len].to_vec();
        self.server_challenge = decrypted[hash_len..hash_len + 16].to_vec();
        self.state = State::ChallengeResponseReady;
        Ok(StageProgress::Continue)
    }

    /// Stage 3 request: hash of (server challenge || our cert signature ||
    /// our secret), zero-padded to 32 bytes and encrypted.
    pub fn challenge_response_request(&mut self) -> Result<String> {
        self.expect_state(
            State::ChallengeResponseReady,
            "challenge response before server challenge",
        )?;

        let mut message = Vec::new();
        message.extend_from_slice(&self.server_challenge);
        message.extend_from_slice(self.identity.certificate_signature());
        message.extend_from_slice(&self.client_secret);

        let padded = self.algo.hash_padded_32(&message);
        let encrypted = self
            .cipher
            .encrypt(&padded)
            .map_err(|e| PairingError::Protocol(e.to_string()))?;

        self.state = State::ChallengeResponseSent;
        Ok(format!(
            "devicename=roth&updateState=1&serverchallengeresp={}",
            hex::encode(encrypted)
        ))
    }

    /// Stage 3 response: the host's pairing secret. Verifies the host's
    /// signature over its secret (MITM detection) and the PIN transcript.
    pub fn process_pairing_secret(&mut self, xml: &str) -> Result<StageProgress> {
        self.expect_state(
            State::ChallengeResponseSent,
            "pairing secret before challenge response",
        )?;

        if !Self::response_paired(xml) {
            warn!("Pairing failed at the challenge-response stage");
            self.state = State::Failed;
            return Ok(StageProgress::Terminal(PairOutcome::Failed));
        }

        let pairing_secret = match xml_hex_bytes(xml, "pairingsecret") {
            Ok(Some(bytes)) if bytes.len() > 16 => bytes,
            Ok(_) => return self.fail(PairingError::Protocol("missing pairingsecret".into())),
            Err(e) => return self.fail(PairingError::Protocol(e.to_string())),
        };
        let server_secret = &pairing_secret[..16];
        let server_signature = &pairing_secret[16..];

        let server_cert = self
            .server_cert_pem
            .clone()
            .ok_or(PairingError::InvalidState("no pinned server cert"))?;

        match verify_rsa_sha256(&server_cert, server_secret, server_signature) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Host signature verification failed; likely MITM");
                self.state = State::Failed;
                return Ok(StageProgress::Terminal(PairOutcome::Failed));
            }
            Err(e) => return self.fail(PairingError::Protocol(e.to_string())),
        }

        let server_cert_signature = match certificate_signature_bytes(&server_cert) {
            Ok(sig) => sig,
            Err(e) => return self.fail(PairingError::Protocol(e.to_string())),
        };

        let mut expected_input = Vec::new();
        expected_input.extend_from_slice(&self.client_challenge);
        expected_input.extend_from_slice(&server_cert_signature);
        expected_input.extend_from_slice(server_secret);

        if self.algo.hash(&expected_input) != self.server_response {
            warn!("Host response does not match our PIN transcript");
            self.state = State::Failed;
            return Ok(StageProgress::Terminal(PairOutcome::PinWrong));
        }

        self.state = State::SecretReady;
        Ok(StageProgress::Continue)
    }

    /// Stage 4 request: reveal our secret, signed with our private key.
    pub fn client_secret_request(&mut self) -> Result<String> {
        self.expect_state(State::SecretReady, "client secret before verification")?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&self.client_secret);
        payload.extend_from_slice(&self.identity.sign(&self.client_secret));

        self.state = State::SecretSent;
        Ok(format!(
            "devicename=roth&updateState=1&clientpairingsecret={}",
            hex::encode(payload)
        ))
    }

    pub fn process_client_secret_response(&mut self, xml: &str) -> Result<StageProgress> {
        self.expect_state(State::SecretSent, "secret response before secret")?;

        if !Self::response_paired(xml) {
            warn!("Pairing failed at the client-secret stage");
            self.state = State::Failed;
            return Ok(StageProgress::Terminal(PairOutcome::Failed));
        }

        self.state = State::PairChallengeSent;
        Ok(StageProgress::Continue)
    }

    /// Stage 5 request, issued over HTTPS: confirms the TLS channel
    /// authenticates under the freshly pinned certificate.
    pub fn pair_challenge_request(&self) -> &'static str {
        "devicename=roth&updateState=1&phrase=pairchallenge"
    }

    pub fn process_pair_challenge_response(&mut self, xml: &str) -> Result<StageProgress> {
        self.expect_state(State::PairChallengeSent, "pair challenge out of order")?;

        if !Self::response_paired(xml) {
            warn!("Pairing failed at the pair-challenge stage");
            self.state = State::Failed;
            return Ok(StageProgress::Terminal(PairOutcome::Failed));
        }

        self.state = State::Complete;
        let cert = self
            .server_cert_pem
            .clone()
            .ok_or(PairingError::InvalidState("completed without a server cert"))?;
        Ok(StageProgress::Terminal(PairOutcome::Paired {
            server_cert_pem: cert,
        }))
    }
}
