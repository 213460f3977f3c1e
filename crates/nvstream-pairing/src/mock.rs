//! An in-process mock host implementing the server side of the pairing
//! math, for exercising the engine without a network.

use nvstream_crypto::{
    certificate_signature_bytes, derive_pairing_key, random_bytes, verify_rsa_sha256,
    Aes128EcbCipher, ClientIdentity, HashAlgorithm,
};
use std::collections::HashMap;
use std::sync::Arc;

pub struct MockPairHost {
    identity: Arc<ClientIdentity>,
    pin: String,
    algo: HashAlgorithm,
    busy: bool,
    forge_signature: bool,
    cipher: Option<Aes128EcbCipher>,
    client_cert_pem: Option<String>,
    client_challenge: Vec<u8>,
    client_hash: Vec<u8>,
    server_secret: [u8; 16],
    server_challenge: [u8; 16],
    paired: bool,
}

impl MockPairHost {
    pub fn new(identity: Arc<ClientIdentity>, pin: &str) -> Self {
        Self::new_with_generation(identity, pin, 7)
    }

    pub fn new_with_generation(identity: Arc<ClientIdentity>, pin: &str, generation: i32) -> Self {
        let mut server_secret = [0u8; 16];
        server_secret.copy_from_slice(&random_bytes(16));
        let mut server_challenge = [0u8; 16];
        server_challenge.copy_from_slice(&random_bytes(16));

        Self {
            identity,
            pin: pin.to_string(),
            algo: HashAlgorithm::for_server_generation(generation),
            busy: false,
            forge_signature: false,
            cipher: None,
            client_cert_pem: None,
            client_challenge: Vec::new(),
            client_hash: Vec::new(),
            server_secret,
            server_challenge,
            paired: false,
        }
    }

    /// Simulate another client mid-pairing: stage 1 answers without a
    /// certificate.
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Respond with a bogus signature over the server secret, as a
    /// man-in-the-middle relaying the real certificate would have to.
    pub fn forge_secret_signature(&mut self) {
        self.forge_signature = true;
    }

    pub fn is_paired(&self) -> bool {
        self.paired
    }

    /// Handle one `pair` (or `unpair`) request's query arguments, returning
    /// the response XML.
    pub fn handle(&mut self, arguments: &str) -> String {
        let params: HashMap<&str, &str> = arguments
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .collect();

        if params.get("phrase") == Some(&"getservercert") {
            return self.handle_get_server_cert(&params);
        }
        if let Some(challenge_hex) = params.get("clientchallenge") {
            return self.handle_client_challenge(challenge_hex);
        }
        if let Some(resp_hex) = params.get("serverchallengeresp") {
            return self.handle_server_challenge_resp(resp_hex);
        }
        if let Some(secret_hex) = params.get("clientpairingsecret") {
            return self.handle_client_secret(secret_hex);
        }
        if params.get("phrase") == Some(&"pairchallenge") {
            return paired_response(self.paired, "");
        }

        // unpair or anything unrecognized
        self.paired = false;
        self.cipher = None;
        paired_response(true, "")
    }

    fn handle_get_server_cert(&mut self, params: &HashMap<&str, &str>) -> String {
        let salt_bytes = params
            .get("salt")
            .and_then(|s| hex::decode(s).ok())
            .unwrap_or_default();
        if salt_bytes.len() != 16 {
            return paired_response(false, "");
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&salt_bytes);

        if let Some(cert_hex) = params.get("clientcert") {
            if let Ok(bytes) = hex::decode(cert_hex) {
                self.client_cert_pem = String::from_utf8(bytes).ok();
            }
        }

        // The host derives its key from its own notion of the PIN; a
        // mismatch surfaces as a transcript mismatch at stage 3.
        let key = derive_pairing_key(self.algo, &salt, &self.pin);
        self.cipher = Some(Aes128EcbCipher::new(key));

        if self.busy {
            return paired_response(true, "");
        }

        let plaincert = hex::encode(self.identity.certificate_pem().as_bytes());
        paired_response(true, &format!("<plaincert>{}</plaincert>", plaincert))
    }

    fn handle_client_challenge(&mut self, challenge_hex: &str) -> String {
        let cipher = match &self.cipher {
            Some(c) => c,
            None => return paired_response(false, ""),
        };
        let encrypted = match hex::decode(challenge_hex) {
            Ok(b) => b,
            Err(_) => return paired_response(false, ""),
        };
        self.client_challenge = match cipher.decrypt(&encrypted) {
            Ok(c) => c,
            Err(_) => return paired_response(false, ""),
        };

        let mut transcript = Vec::new();
        transcript.extend_from_slice(&self.client_challenge);
        transcript.extend_from_slice(self.identity.certificate_signature());
        transcript.extend_from_slice(&self.server_secret);

        let mut payload = self.algo.hash(&transcript);
        payload.extend_from_slice(&self.server_challenge);
        // Pad to the cipher block size (SHA-1 transcripts are 36 bytes).
        while payload.len() % 16 != 0 {
            payload.push(0);
        }

        let encrypted = cipher.encrypt(&payload).expect("block-aligned payload");
        paired_response(
            true,
            &format!("<challengeresponse>{}</challengeresponse>", hex::encode(encrypted)),
        )
    }

    fn handle_server_challenge_resp(&mut self, resp_hex: &str) -> String {
        let cipher = match &self.cipher {
            Some(c) => c,
            None => return paired_response(false, ""),
        };
        let encrypted = match hex::decode(resp_hex) {
            Ok(b) => b,
            Err(_) => return paired_response(false, ""),
        };
        self.client_hash = match cipher.decrypt(&encrypted) {
            Ok(h) => h,
            Err(_) => return paired_response(false, ""),
        };

        let signature = if self.forge_signature {
            random_bytes(256)
        } else {
            self.identity.sign(&self.server_secret)
        };

        let mut pairing_secret = self.server_secret.to_vec();
        pairing_secret.extend_from_slice(&signature);
        paired_response(
            true,
            &format!("<pairingsecret>{}</pairingsecret>", hex::encode(pairing_secret)),
        )
    }

    fn handle_client_secret(&mut self, secret_hex: &str) -> String {
        let payload = match hex::decode(secret_hex) {
            Ok(b) if b.len() > 16 => b,
            _ => return paired_response(false, ""),
        };
        let client_secret = &payload[..16];
        let client_signature = &payload[16..];

        let client_cert = match &self.client_cert_pem {
            Some(c) => c.clone(),
            None => return paired_response(false, ""),
        };

        let signature_ok =
            verify_rsa_sha256(&client_cert, client_secret, client_signature).unwrap_or(false);

        let client_cert_signature = match certificate_signature_bytes(&client_cert) {
            Ok(s) => s,
            Err(_) => return paired_response(false, ""),
        };

        let mut transcript = Vec::new();
        transcript.extend_from_slice(&self.server_challenge);
        transcript.extend_from_slice(&client_cert_signature);
        transcript.extend_from_slice(client_secret);
        let expected = self.algo.hash_padded_32(&transcript);

        if signature_ok && self.client_hash == expected {
            self.paired = true;
            paired_response(true, "")
        } else {
            paired_response(false, "")
        }
    }
}

fn paired_response(paired: bool, extra: &str) -> String {
    format!(
        r#"<root protocol_version="0.1" status_code="200"><paired>{}</paired>{}</root>"#,
        if paired { 1 } else { 0 },
        extra
    )
}
