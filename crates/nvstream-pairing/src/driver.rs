//! Async driver running the pairing engine against a host over HTTP.

use crate::engine::{PairOutcome, PairingEngine, StageProgress};
use nvstream_core::{parse_quad, PairingError, Result};
use nvstream_crypto::ClientIdentity;
use nvstream_http::{BaseUrl, LogLevel, NvHttpClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the full pairing handshake. The HTTP client must be bound to the
/// host's address with its HTTPS port already learned from serverinfo; on
/// success the pinned certificate is left set on the client and returned in
/// the outcome.
///
/// Transport errors propagate as `Err` after a best-effort `unpair`; logical
/// protocol outcomes (wrong PIN, busy host, rejection) come back as
/// `Ok(outcome)`, likewise after `unpair`.
pub async fn pair_host(
    http: &mut NvHttpClient,
    identity: Arc<ClientIdentity>,
    server_app_version: &str,
    pin: &str,
) -> Result<PairOutcome> {
    let generation = parse_quad(server_app_version).first().copied().unwrap_or(0);
    info!(generation, "Starting pairing handshake");

    let mut engine = PairingEngine::new(identity, generation, pin);

    // Stage 1 runs with no timeout: the host blocks until the user has
    // typed the PIN into it.
    let args = engine.salt_request()?;
    let xml = http
        .open_connection(BaseUrl::Http, "pair", &args, None, LogLevel::Verbose)
        .await?;
    match engine.process_salt_response(&xml) {
        // The host rejected the attempt outright; there is no partial
        // pairing state on it to clean up.
        Ok(StageProgress::Terminal(PairOutcome::Failed)) => return Ok(PairOutcome::Failed),
        Ok(StageProgress::Terminal(outcome)) => {
            best_effort_unpair(http).await;
            return Ok(outcome);
        }
        Ok(StageProgress::Continue) => {}
        Err(e) => {
            best_effort_unpair(http).await;
            return Err(e);
        }
    }

    // Pin the host certificate for the rest of the handshake; on success it
    // is propagated into the host record.
    let server_cert = engine
        .server_cert_pem()
        .ok_or(PairingError::InvalidState("stage 1 left no server cert"))?
        .to_string();
    if let Err(e) = http.set_server_cert(server_cert) {
        best_effort_unpair(http).await;
        return Err(e);
    }

    let args = engine.challenge_request()?;
    let xml = stage_request(http, BaseUrl::Http, &args).await?;
    if let StageProgress::Terminal(outcome) = engine.process_challenge_response(&xml)? {
        best_effort_unpair(http).await;
        return Ok(outcome);
    }

    let args = engine.challenge_response_request()?;
    let xml = stage_request(http, BaseUrl::Http, &args).await?;
    if let StageProgress::Terminal(outcome) = engine.process_pairing_secret(&xml)? {
        best_effort_unpair(http).await;
        return Ok(outcome);
    }

    let args = engine.client_secret_request()?;
    let xml = stage_request(http, BaseUrl::Http, &args).await?;
    if let StageProgress::Terminal(outcome) = engine.process_client_secret_response(&xml)? {
        best_effort_unpair(http).await;
        return Ok(outcome);
    }

    // The final challenge runs over HTTPS to prove the pinned certificate
    // authenticates the TLS channel.
    let args = engine.pair_challenge_request();
    let xml = stage_request(http, BaseUrl::Https, args).await?;
    match engine.process_pair_challenge_response(&xml)? {
        StageProgress::Terminal(outcome) => {
            if !matches!(outcome, PairOutcome::Paired { .. }) {
                best_effort_unpair(http).await;
            }
            Ok(outcome)
        }
        StageProgress::Continue => {
            Err(PairingError::InvalidState("pair challenge did not terminate").into())
        }
    }
}

async fn stage_request(http: &NvHttpClient, base: BaseUrl, args: &str) -> Result<String> {
    match http
        .open_connection(base, "pair", args, Some(REQUEST_TIMEOUT), LogLevel::Verbose)
        .await
    {
        Ok(xml) => Ok(xml),
        Err(e) => {
            best_effort_unpair(http).await;
            Err(e)
        }
    }
}

async fn best_effort_unpair(http: &NvHttpClient) {
    let _ = http
        .open_connection(BaseUrl::Http, "unpair", "", Some(REQUEST_TIMEOUT), LogLevel::None)
        .await;
}
