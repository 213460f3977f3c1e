//! App launch/resume bring-up against the host.

use nvstream_core::{HostState, Result, StreamConfig};
use nvstream_http::NvHttpClient;
use tracing::info;

/// What to start and how input/audio behave on the host side.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub app_id: i32,
    /// Let the host optimize game settings for streaming.
    pub sops: bool,
    /// Keep audio playing on the host instead of the client.
    pub local_audio: bool,
    pub gamepad_mask: u32,
    pub persist_gamepads_on_disconnect: bool,
}

/// A fresh start uses `launch`; rejoining a session the host already has
/// running uses `resume`.
pub fn launch_verb(current_game: i32) -> &'static str {
    if current_game != 0 {
        "resume"
    } else {
        "launch"
    }
}

/// Start or resume the app, returning the RTSP session URL the streaming
/// layer connects to (when the host provides one).
pub async fn start_app(
    http: &NvHttpClient,
    host: &HostState,
    request: &LaunchRequest,
    config: &StreamConfig,
) -> Result<Option<String>> {
    let verb = launch_verb(host.current_game);
    info!(
        app_id = request.app_id,
        verb, "Starting app on {}", host.name
    );

    http.start_app(
        verb,
        request.app_id,
        config,
        request.sops,
        request.local_audio,
        request.gamepad_mask,
        request.persist_gamepads_on_disconnect,
    )
    .await
}
