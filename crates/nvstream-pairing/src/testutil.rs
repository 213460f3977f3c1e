//! Shared identities for tests. RSA keypair generation is expensive, so the
//! client and host identities are generated once per test process.

use nvstream_crypto::ClientIdentity;
use std::sync::{Arc, OnceLock};

static CLIENT: OnceLock<Arc<ClientIdentity>> = OnceLock::new();
static SERVER: OnceLock<Arc<ClientIdentity>> = OnceLock::new();

pub fn client_identity() -> Arc<ClientIdentity> {
    CLIENT
        .get_or_init(|| Arc::new(ClientIdentity::generate().expect("generate client identity")))
        .clone()
}

pub fn server_identity() -> Arc<ClientIdentity> {
    SERVER
        .get_or_init(|| Arc::new(ClientIdentity::generate().expect("generate server identity")))
        .clone()
}
