//! User preferences, session options, and stream-config assembly.

use nvstream_core::{AudioConfiguration, StreamConfig, ENCFLG_ALL, ENCFLG_AUDIO};
use rand::RngCore;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodecConfig {
    Auto,
    ForceH264,
    ForceHevc,
    ForceAv1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoDecoderSelection {
    Auto,
    ForceHardware,
    ForceSoftware,
}

/// The user's streaming preferences, read as a typed value from the
/// (out-of-scope) settings layer.
#[derive(Debug, Clone)]
pub struct Preferences {
    /// 0x0 means "Auto": re-read the display size at every session start.
    pub width: i32,
    pub height: i32,
    pub fps: i32,
    pub bitrate_kbps: i32,
    pub video_codec_config: VideoCodecConfig,
    pub video_decoder_selection: VideoDecoderSelection,
    pub enable_hdr: bool,
    pub enable_yuv444: bool,
    pub audio_config: AudioConfiguration,
    pub enable_vsync: bool,
    pub frame_pacing: bool,
    pub mute_on_focus_loss: bool,
    pub quit_app_after: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fps: 60,
            bitrate_kbps: 20000,
            video_codec_config: VideoCodecConfig::Auto,
            video_decoder_selection: VideoDecoderSelection::Auto,
            enable_hdr: false,
            enable_yuv444: false,
            audio_config: AudioConfiguration::Stereo,
            enable_vsync: true,
            frame_pacing: true,
            mute_on_focus_loss: false,
            quit_app_after: false,
        }
    }
}

impl Preferences {
    /// "Auto" is a property of the preference, not of any concrete size the
    /// orchestrator later computed from it.
    pub fn is_auto_resolution(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

/// The current display, as seen by the windowing layer.
pub trait DisplayInfo: Send + Sync {
    /// Physical pixel size of the display backing the session window.
    fn physical_size(&self) -> Option<(i32, i32)>;
    /// Refresh rate in Hz.
    fn refresh_rate(&self) -> i32;
}

/// Relevant capabilities of the client machine.
#[derive(Debug, Clone, Copy)]
pub struct ClientCapabilities {
    pub aes_acceleration: bool,
    pub cpu_cores: u32,
}

/// Full encryption needs hardware AES and enough cores to hide the cost;
/// otherwise only the audio stream is encrypted.
pub fn encryption_flags(caps: ClientCapabilities) -> u32 {
    if caps.aes_acceleration && caps.cpu_cores > 2 {
        ENCFLG_ALL
    } else {
        ENCFLG_AUDIO
    }
}

/// Resolve the session dimensions. In Auto mode the display's physical size
/// is re-read on every start and restart (form-factor changes between
/// sessions are honored), with each dimension rounded down to an even
/// integer.
pub fn resolve_dimensions(prefs: &Preferences, display: &dyn DisplayInfo) -> (i32, i32) {
    if !prefs.is_auto_resolution() {
        return (prefs.width, prefs.height);
    }

    match display.physical_size() {
        Some((width, height)) => {
            let width = width & !1;
            let height = height & !1;
            info!("Auto-detected screen resolution: {}x{}", width, height);
            (width, height)
        }
        None => {
            warn!("Unable to auto-detect screen resolution. Defaulting to 1280x720.");
            (1280, 720)
        }
    }
}

/// Assemble the pre-negotiation stream configuration from preferences. The
/// video format field is filled in by negotiation.
pub fn build_stream_config(
    prefs: &Preferences,
    display: &dyn DisplayInfo,
    caps: ClientCapabilities,
) -> StreamConfig {
    let (width, height) = resolve_dimensions(prefs, display);

    let mut remote_input_key = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut remote_input_key);
    // Only the first 4 bytes of the RI key IV are populated.
    let mut iv_prefix = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut iv_prefix);

    StreamConfig {
        width,
        height,
        fps: prefs.fps,
        bitrate_kbps: prefs.bitrate_kbps,
        packet_size: 1392,
        audio_configuration: prefs.audio_config,
        supported_video_formats: 0,
        enable_hdr: prefs.enable_hdr,
        encryption_flags: encryption_flags(caps),
        remote_input_key,
        remote_input_key_id: i32::from_be_bytes(iv_prefix),
    }
}

#[cfg(test)]
pub(crate) struct FixedDisplay {
    pub size: Option<(i32, i32)>,
    pub hz: i32,
}

#[cfg(test)]
impl DisplayInfo for FixedDisplay {
    fn physical_size(&self) -> Option<(i32, i32)> {
        self.size
    }

    fn refresh_rate(&self) -> i32 {
        self.hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_resolution_is_a_preference_property() {
        let mut prefs = Preferences::default();
        assert!(prefs.is_auto_resolution());

        prefs.width = 1920;
        prefs.height = 1080;
        assert!(!prefs.is_auto_resolution());
    }

    #[test]
    fn auto_mode_reads_display_and_rounds_down_to_even() {
        let prefs = Preferences::default();
        let display = FixedDisplay {
            size: Some((1537, 1007)),
            hz: 60,
        };
        assert_eq!(resolve_dimensions(&prefs, &display), (1536, 1006));
    }

    #[test]
    fn auto_mode_falls_back_without_a_display() {
        let prefs = Preferences::default();
        let display = FixedDisplay { size: None, hz: 60 };
        assert_eq!(resolve_dimensions(&prefs, &display), (1280, 720));
    }

    #[test]
    fn explicit_resolution_ignores_display() {
        let prefs = Preferences {
            width: 2560,
            height: 1440,
            ..Preferences::default()
        };
        let display = FixedDisplay {
            size: Some((1920, 1080)),
            hz: 60,
        };
        assert_eq!(resolve_dimensions(&prefs, &display), (2560, 1440));
    }

    #[test]
    fn encryption_needs_aes_and_cores() {
        let full = ClientCapabilities {
            aes_acceleration: true,
            cpu_cores: 8,
        };
        assert_eq!(encryption_flags(full), ENCFLG_ALL);

        let weak_cpu = ClientCapabilities {
            aes_acceleration: true,
            cpu_cores: 2,
        };
        assert_eq!(encryption_flags(weak_cpu), ENCFLG_AUDIO);

        let no_aes = ClientCapabilities {
            aes_acceleration: false,
            cpu_cores: 16,
        };
        assert_eq!(encryption_flags(no_aes), ENCFLG_AUDIO);
    }

    #[test]
    fn stream_config_carries_fresh_ri_key() {
        let prefs = Preferences::default();
        let display = FixedDisplay {
            size: Some((1920, 1080)),
            hz: 60,
        };
        let caps = ClientCapabilities {
            aes_acceleration: true,
            cpu_cores: 8,
        };

        let a = build_stream_config(&prefs, &display, caps);
        let b = build_stream_config(&prefs, &display, caps);
        assert_ne!(a.remote_input_key, b.remote_input_key);
        assert_eq!(a.width, 1920);
        assert_eq!(a.fps, 60);
    }
}
