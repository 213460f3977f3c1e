//! Per-host HTTP/HTTPS client for the GameStream control protocol.
//!
//! Commands are XML-over-GET with percent-encoded query parameters. The
//! plain HTTP endpoint serves identity queries and the pairing exchange;
//! everything authenticated runs over HTTPS with the pinned certificate.

use crate::tls::pinned_tls_config;
use crate::xml;
use nvstream_core::{
    AppEntry, Error, HostAddress, HostProtocolError, Result, StreamConfig, TransportError,
    TransportErrorKind,
};
use nvstream_crypto::ClientIdentity;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed client id sent with every request; hosts key paired state on the
/// certificate, not this value.
pub const CLIENT_UNIQUE_ID: &str = "0123456789ABCDEF";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const FAST_FAIL_TIMEOUT: Duration = Duration::from_secs(2);
const SERVICE_UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    None,
    Error,
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseUrl {
    Http,
    Https,
}

/// A client bound to one host address, an HTTPS port (0 until learned from
/// serverinfo), and an optional pinned server certificate.
pub struct NvHttpClient {
    address: HostAddress,
    https_port: u16,
    server_cert_pem: Option<String>,
    identity: Arc<ClientIdentity>,
    http: reqwest::Client,
    https: Option<reqwest::Client>,
}

impl NvHttpClient {
    pub fn new(
        address: HostAddress,
        https_port: u16,
        server_cert_pem: Option<String>,
        identity: Arc<ClientIdentity>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::new(TransportErrorKind::Io, e.to_string()))?;

        let mut client = Self {
            address,
            https_port,
            server_cert_pem: None,
            identity,
            http,
            https: None,
        };
        if let Some(pem) = server_cert_pem {
            if !pem.is_empty() {
                client.set_server_cert(pem)?;
            }
        }
        Ok(client)
    }

    pub fn address(&self) -> &HostAddress {
        &self.address
    }

    pub fn https_port(&self) -> u16 {
        self.https_port
    }

    pub fn server_cert_pem(&self) -> Option<&str> {
        self.server_cert_pem.as_deref()
    }

    pub fn set_address(&mut self, address: HostAddress) {
        self.address = address;
    }

    pub fn set_https_port(&mut self, port: u16) {
        self.https_port = port;
    }

    /// Pin a server certificate. All HTTPS traffic from here on requires the
    /// peer to present exactly these bytes.
    pub fn set_server_cert(&mut self, server_cert_pem: String) -> Result<()> {
        let tls = pinned_tls_config(&server_cert_pem, &self.identity)?;
        let https = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .build()
            .map_err(|e| TransportError::new(TransportErrorKind::Tls, e.to_string()))?;

        self.server_cert_pem = Some(server_cert_pem);
        self.https = Some(https);
        Ok(())
    }

    fn base_url(&self, base: BaseUrl) -> Result<String> {
        match base {
            BaseUrl::Http => Ok(format!("http://{}", self.address.to_url_host())),
            BaseUrl::Https => {
                if self.https_port == 0 {
                    return Err(TransportError::new(
                        TransportErrorKind::ConnectionRefused,
                        "HTTPS port not yet known",
                    )
                    .into());
                }
                let addr = HostAddress::new(self.address.address.clone(), self.https_port);
                Ok(format!("https://{}", addr.to_url_host()))
            }
        }
    }

    fn transport_for(&self, base: BaseUrl) -> Result<&reqwest::Client> {
        match base {
            BaseUrl::Http => Ok(&self.http),
            BaseUrl::Https => self.https.as_ref().ok_or_else(|| {
                TransportError::new(
                    TransportErrorKind::Tls,
                    "No pinned certificate; HTTPS endpoint unusable",
                )
                .into()
            }),
        }
    }

    fn map_transport_error(err: reqwest::Error) -> TransportError {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::ConnectionRefused
        } else {
            TransportErrorKind::Io
        };
        TransportError::new(kind, err.to_string())
    }

    async fn issue_request(
        &self,
        base: BaseUrl,
        command: &str,
        arguments: &str,
        timeout: Option<Duration>,
        log_level: LogLevel,
    ) -> Result<reqwest::Response> {
        let mut url = format!(
            "{}/{}?uniqueid={}&uuid={}",
            self.base_url(base)?,
            command,
            CLIENT_UNIQUE_ID,
            request_nonce()
        );
        if !arguments.is_empty() {
            url.push('&');
            url.push_str(arguments);
        }

        if log_level == LogLevel::Verbose {
            debug!(%url, "Issuing request");
        }

        let mut request = self.transport_for(base)?.get(&url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(Self::map_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(TransportError::new(
                TransportErrorKind::ServiceUnavailable,
                "Host returned 503 Service Unavailable",
            )
            .into());
        }
        if !status.is_success() {
            return Err(HostProtocolError::new(
                status.as_u16() as i32,
                status.canonical_reason().unwrap_or("HTTP error").to_string(),
            )
            .into());
        }

        Ok(response)
    }

    /// Generic command request returning the XML response body. The XML
    /// status code is verified; non-200 raises a host protocol error.
    pub async fn open_connection(
        &self,
        base: BaseUrl,
        command: &str,
        arguments: &str,
        timeout: Option<Duration>,
        log_level: LogLevel,
    ) -> Result<String> {
        let response = self
            .issue_request(base, command, arguments, timeout, log_level)
            .await?;
        let body = response
            .text()
            .await
            .map_err(Self::map_transport_error)?;

        if log_level == LogLevel::Verbose {
            debug!(%command, body_len = body.len(), "Response received");
        }

        if let Err(e) = xml::verify_response_status(&body) {
            if log_level != LogLevel::None {
                warn!(%command, status = e.status, "Host rejected request: {}", e.message);
            }
            return Err(e.into());
        }
        Ok(body)
    }

    /// Issue a `serverinfo` query. Uses the HTTPS endpoint when a
    /// certificate is pinned; otherwise only the plain HTTP endpoint is
    /// usable. A 503 answer is retried once after a pause, except on the
    /// fast-fail polling path.
    pub async fn server_info(&self, log_level: LogLevel, fast_fail: bool) -> Result<String> {
        let timeout = if fast_fail {
            FAST_FAIL_TIMEOUT
        } else {
            REQUEST_TIMEOUT
        };

        let mut attempted_retry = false;
        loop {
            let result = self.server_info_once(timeout, log_level).await;
            match result {
                Err(Error::Transport(ref e))
                    if e.is_service_unavailable() && !attempted_retry && !fast_fail =>
                {
                    warn!("Host not ready (503), retrying in {:?}", SERVICE_UNAVAILABLE_BACKOFF);
                    attempted_retry = true;
                    tokio::time::sleep(SERVICE_UNAVAILABLE_BACKOFF).await;
                }
                other => return other,
            }
        }
    }

    async fn server_info_once(&self, timeout: Duration, log_level: LogLevel) -> Result<String> {
        let base = if self.server_cert_pem.is_some() && self.https_port != 0 {
            BaseUrl::Https
        } else {
            BaseUrl::Http
        };
        self.open_connection(base, "serverinfo", "", Some(timeout), log_level)
            .await
    }

    /// Launch a fresh app (`verb` = "launch") or rejoin a running session
    /// (`verb` = "resume"). Returns the RTSP session URL when the host
    /// provides one.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_app(
        &self,
        verb: &str,
        app_id: i32,
        config: &StreamConfig,
        sops: bool,
        local_audio: bool,
        gamepad_mask: u32,
        persist_gamepads_on_disconnect: bool,
    ) -> Result<Option<String>> {
        let rikey = hex::encode(config.remote_input_key);

        let arguments = if verb == "launch" {
            let mut args = format!(
                "appid={}&mode={}x{}x{}&additionalStates=1&sops={}&rikey={}&rikeyid={}&localAudioPlayMode={}&surroundAudioInfo={}&gcmap={}&gcpersist={}",
                app_id,
                config.width,
                config.height,
                config.fps,
                sops as u8,
                rikey,
                config.remote_input_key_id,
                local_audio as u8,
                config.audio_configuration.surround_audio_info(),
                gamepad_mask,
                persist_gamepads_on_disconnect as u8,
            );
            if config.enable_hdr {
                args.push_str("&hdrMode=1&clientHdrCapVersion=0&clientHdrCapSupportedFlagsInUint32=0");
            }
            args
        } else {
            format!(
                "rikey={}&rikeyid={}&surroundAudioInfo={}",
                rikey,
                config.remote_input_key_id,
                config.audio_configuration.surround_audio_info(),
            )
        };

        let response = self
            .open_connection(
                BaseUrl::Https,
                verb,
                &arguments,
                Some(REQUEST_TIMEOUT),
                LogLevel::Verbose,
            )
            .await?;

        let session_leaf = if verb == "launch" { "gamesession" } else { "resume" };
        match xml::xml_string(&response, session_leaf).as_deref() {
            Some("0") | None => {
                return Err(HostProtocolError::new(-1, "Host declined to start the app").into())
            }
            Some(_) => {}
        }

        Ok(xml::xml_string(&response, "sessionUrl0").filter(|s| !s.is_empty()))
    }

    /// Ask the host to terminate the running app.
    pub async fn quit_app(&self) -> Result<()> {
        let response = self
            .open_connection(
                BaseUrl::Https,
                "cancel",
                "",
                Some(REQUEST_TIMEOUT),
                LogLevel::Verbose,
            )
            .await?;

        if xml::xml_string(&response, "cancel").as_deref() == Some("0") {
            // The host refuses to quit sessions started by other clients.
            return Err(HostProtocolError::new(
                599,
                "The running app was not started by this client",
            )
            .into());
        }
        Ok(())
    }

    /// Fetch the host's application list.
    pub async fn app_list(&self) -> Result<Vec<AppEntry>> {
        let response = self
            .open_connection(
                BaseUrl::Https,
                "applist",
                "",
                Some(REQUEST_TIMEOUT),
                LogLevel::Verbose,
            )
            .await?;

        let https_base = self.base_url(BaseUrl::Https)?;
        Ok(xml::parse_app_list(&response)
            .into_iter()
            .map(|(id, name, hdr_supported)| AppEntry {
                box_art_url: format!(
                    "{}/appasset?uniqueid={}&appid={}&AssetType=2&AssetIdx=0",
                    https_base, CLIENT_UNIQUE_ID, id
                ),
                id,
                name,
                hdr_supported,
            })
            .collect())
    }

    /// Fetch box art image bytes for one app.
    pub async fn box_art(&self, app_id: i32) -> Result<Vec<u8>> {
        let arguments = format!("appid={}&AssetType=2&AssetIdx=0", app_id);
        let response = self
            .issue_request(
                BaseUrl::Https,
                "appasset",
                &arguments,
                Some(REQUEST_TIMEOUT),
                LogLevel::None,
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(Self::map_transport_error)?;
        Ok(bytes.to_vec())
    }
}

/// Per-request cache-buster, hex of 16 random bytes.
fn request_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> Arc<ClientIdentity> {
        Arc::new(ClientIdentity::generate().unwrap())
    }

    #[test]
    fn https_base_requires_known_port() {
        let client = NvHttpClient::new(
            HostAddress::new("192.168.1.50", 47989),
            0,
            None,
            test_identity(),
        )
        .unwrap();
        assert!(client.base_url(BaseUrl::Http).is_ok());
        assert!(client.base_url(BaseUrl::Https).is_err());
    }

    #[test]
    fn https_transport_requires_pinned_cert() {
        let client = NvHttpClient::new(
            HostAddress::new("192.168.1.50", 47989),
            47984,
            None,
            test_identity(),
        )
        .unwrap();
        assert!(client.transport_for(BaseUrl::Http).is_ok());
        assert!(client.transport_for(BaseUrl::Https).is_err());
    }

    #[test]
    fn pinning_a_cert_enables_https() {
        let identity = test_identity();
        let mut client = NvHttpClient::new(
            HostAddress::new("192.168.1.50", 47989),
            47984,
            None,
            identity.clone(),
        )
        .unwrap();

        client
            .set_server_cert(identity.certificate_pem().to_string())
            .unwrap();
        assert!(client.transport_for(BaseUrl::Https).is_ok());
        assert!(client.server_cert_pem().is_some());
    }

    #[test]
    fn ipv6_addresses_are_bracketed_in_urls() {
        let client = NvHttpClient::new(
            HostAddress::new("2600:1700::4", 47989),
            47984,
            None,
            test_identity(),
        )
        .unwrap();
        assert_eq!(
            client.base_url(BaseUrl::Http).unwrap(),
            "http://[2600:1700::4]:47989"
        );
        assert_eq!(
            client.base_url(BaseUrl::Https).unwrap(),
            "https://[2600:1700::4]:47984"
        );
    }

    #[test]
    fn request_nonces_are_unique() {
        assert_ne!(request_nonce(), request_nonce());
    }
}
