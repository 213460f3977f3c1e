//! Video format negotiation and launch validation.
//!
//! The orchestrator owns a priority-ordered candidate list that is whittled
//! down by decoder probes, user preference, and the host's encode
//! capability mask, in that order. Removal strikes candidates; HEVC/AV1
//! that merely lack a hardware decoder are deprioritized, not struck, so a
//! capable host can still pick them up as a fallback.

use crate::config::{Preferences, VideoCodecConfig, VideoDecoderSelection};
use nvstream_core::formats::*;
use nvstream_core::{
    AudioConfiguration, HostState, NegotiationError, Result, StreamConfig, SupportedFormats,
};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderAvailability {
    None,
    Software,
    Hardware,
}

/// Probes the client's decoding capability for one format at the session's
/// dimensions.
pub trait DecoderProbe {
    fn availability(
        &self,
        format: VideoFormat,
        width: i32,
        height: i32,
        fps: i32,
    ) -> DecoderAvailability;
}

/// Minimal audio capability: can a device be opened with this channel
/// configuration?
pub trait AudioSink {
    fn test_config(&self, config: AudioConfiguration) -> bool;
}

/// What negotiation decided: the surviving candidate list (head = chosen
/// format) and the warnings to surface.
#[derive(Debug)]
pub struct NegotiationResult {
    pub formats: SupportedFormats,
    pub warnings: Vec<String>,
}

pub struct Negotiator<'a> {
    pub prefs: &'a Preferences,
    pub host: &'a HostState,
    pub probe: &'a dyn DecoderProbe,
    pub audio: &'a dyn AudioSink,
}

impl<'a> Negotiator<'a> {
    /// Run the full negotiation, mutating the stream config (dimensions,
    /// audio fallback, final format mask) in place.
    pub fn negotiate(&self, config: &mut StreamConfig) -> Result<NegotiationResult> {
        let mut formats = SupportedFormats::all();
        let mut warnings = Vec::new();

        self.apply_codec_policy(&mut formats, config);

        // Mask or deprioritize for the most critical attributes last so
        // they end up lowest priority during server negotiation: a 4:2:0
        // profile beats losing 4:4:4 entirely, and likewise for HDR.
        if !self.prefs.enable_yuv444 {
            formats.remove_by_mask(VIDEO_FORMAT_MASK_YUV444);
        } else {
            formats.deprioritize_by_mask(!VIDEO_FORMAT_MASK_YUV444);
        }

        if !self.prefs.enable_hdr {
            formats.remove_by_mask(VIDEO_FORMAT_MASK_10BIT);
        } else {
            formats.deprioritize_by_mask(!VIDEO_FORMAT_MASK_10BIT);
        }

        self.validate_launch(&mut formats, config, &mut warnings)?;

        // validate_launch reinstated H.264 if the list went empty.
        let chosen = formats.front().unwrap_or(VIDEO_FORMAT_H264);
        config.supported_video_formats = chosen;
        info!(format = format_args!("{:#x}", chosen), "Negotiated video format");

        Ok(NegotiationResult { formats, warnings })
    }

    /// The codec-preference phase: probes for Auto, hard strikes for forced
    /// codecs.
    fn apply_codec_policy(&self, formats: &mut SupportedFormats, config: &StreamConfig) {
        match self.prefs.video_codec_config {
            VideoCodecConfig::Auto => self.apply_auto_policy(formats, config),
            VideoCodecConfig::ForceH264 => {
                formats.remove_by_mask(!VIDEO_FORMAT_MASK_H264);
            }
            VideoCodecConfig::ForceHevc => {
                formats.remove_by_mask(!VIDEO_FORMAT_MASK_H265);
            }
            VideoCodecConfig::ForceAv1 => {
                // Fall back to HEVC first if AV1 fails; going straight to
                // H.264 when the user asked for AV1 would be a poor trade.
                formats.remove_by_mask(!(VIDEO_FORMAT_MASK_AV1 | VIDEO_FORMAT_MASK_H265));
            }
        }
    }

    fn apply_auto_policy(&self, formats: &mut SupportedFormats, config: &StreamConfig) {
        let probe = |format| {
            self.probe
                .availability(format, config.width, config.height, config.fps)
        };

        // Codecs are checked in ascending decode complexity so the
        // deprioritized tail prefers lighter codecs for software decoding.
        // H.264 is already lowest priority and needs no probing here.
        let hevc_target = match (self.prefs.enable_yuv444, self.prefs.enable_hdr) {
            (true, true) => VIDEO_FORMAT_H265_REXT10_444,
            (true, false) => VIDEO_FORMAT_H265_REXT8_444,
            (false, true) => VIDEO_FORMAT_H265_MAIN10,
            (false, false) => VIDEO_FORMAT_H265,
        };
        let mut hevc_da = probe(hevc_target);

        if hevc_da == DecoderAvailability::None && self.prefs.enable_hdr {
            // No 10-bit HEVC path at all; strike those profiles.
            formats.remove_by_mask(VIDEO_FORMAT_MASK_H265 & VIDEO_FORMAT_MASK_10BIT);

            let av1_target = if self.prefs.enable_yuv444 {
                VIDEO_FORMAT_AV1_HIGH10_444
            } else {
                VIDEO_FORMAT_AV1_MAIN10
            };
            if probe(av1_target) == DecoderAvailability::None {
                // No 10-bit profiles anywhere; reprobe 8-bit HEVC and
                // proceed as an SDR scenario.
                formats.remove_by_mask(VIDEO_FORMAT_MASK_AV1 & VIDEO_FORMAT_MASK_10BIT);
                let sdr_target = if self.prefs.enable_yuv444 {
                    VIDEO_FORMAT_H265_REXT8_444
                } else {
                    VIDEO_FORMAT_H265
                };
                hevc_da = probe(sdr_target);
            }
        }

        if hevc_da != DecoderAvailability::Hardware {
            // Keep HEVC up front anyway when the user forced software
            // decoding with HDR: H.264 cannot carry 10-bit content.
            if self.prefs.video_decoder_selection != VideoDecoderSelection::ForceSoftware
                || !self.prefs.enable_hdr
            {
                formats.deprioritize_by_mask(VIDEO_FORMAT_MASK_H265);
            }
        }

        // AV1 stays up front only for the HDR-with-software-decoding case,
        // where dav1d outruns software HEVC. On Windows, firmware-disabled
        // HEVC with working AV1 hardware also warrants keeping AV1 probed.
        let keep_av1 = hevc_da != DecoderAvailability::Hardware
            && (self.prefs.enable_hdr || cfg!(target_os = "windows"));
        if !keep_av1 {
            formats.deprioritize_by_mask(VIDEO_FORMAT_MASK_AV1);
        }
    }

    /// Pre-flight checks against the host's capabilities. Warnings are
    /// collected; hard failures refuse the launch.
    fn validate_launch(
        &self,
        formats: &mut SupportedFormats,
        config: &mut StreamConfig,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        if !self.host.is_supported_server_version() {
            return Err(NegotiationError::UnsupportedServerVersion(self.host.name.clone()).into());
        }

        if self.prefs.video_decoder_selection == VideoDecoderSelection::ForceSoftware {
            warnings.push(
                "Your settings selection to force software decoding may cause poor streaming performance."
                    .to_string(),
            );
        }

        let scm = self.host.server_codec_mode_support;

        if formats.contains_any(VIDEO_FORMAT_MASK_AV1) {
            if formats.mask_by_server_codec_modes(scm & SCM_MASK_AV1) == 0 {
                if self.prefs.video_codec_config == VideoCodecConfig::ForceAv1 {
                    warnings.push(
                        "Your host software or GPU doesn't support encoding AV1.".to_string(),
                    );
                }
                formats.remove_by_mask(VIDEO_FORMAT_MASK_AV1);
            } else if self.prefs.video_codec_config == VideoCodecConfig::ForceAv1 {
                formats.remove_by_mask(!VIDEO_FORMAT_MASK_AV1);
            }
        }

        if formats.contains_any(VIDEO_FORMAT_MASK_H265) {
            if self.host.max_luma_pixels_hevc == 0 {
                if self.prefs.video_codec_config == VideoCodecConfig::ForceHevc {
                    warnings.push("Your host PC doesn't support encoding HEVC.".to_string());
                }
                formats.remove_by_mask(VIDEO_FORMAT_MASK_H265);
            } else if self.prefs.video_codec_config == VideoCodecConfig::ForceHevc {
                formats.remove_by_mask(!VIDEO_FORMAT_MASK_H265);
            }
        }

        // Only H.264 left and no hardware H.264 decoder: streamable, but
        // worth telling the user why it may be rough.
        if !formats.contains_any(!VIDEO_FORMAT_MASK_H264)
            && self.prefs.video_decoder_selection == VideoDecoderSelection::Auto
            && self.probe.availability(VIDEO_FORMAT_H264, config.width, config.height, config.fps)
                != DecoderAvailability::Hardware
        {
            if self.host.max_luma_pixels_hevc == 0
                && self
                    .probe
                    .availability(VIDEO_FORMAT_H265, config.width, config.height, config.fps)
                    == DecoderAvailability::Hardware
            {
                warnings.push(
                    "Your host PC and client PC don't support the same video codecs. This may cause poor streaming performance."
                        .to_string(),
                );
            } else {
                warnings.push(
                    "Your client GPU doesn't support H.264 decoding. This may cause poor streaming performance."
                        .to_string(),
                );
            }
        }

        if self.prefs.enable_hdr {
            if self.prefs.video_codec_config == VideoCodecConfig::ForceH264 {
                warnings.push("HDR is not supported using the H.264 codec.".to_string());
                formats.remove_by_mask(VIDEO_FORMAT_MASK_10BIT);
            } else if !formats.contains_any(VIDEO_FORMAT_MASK_10BIT) {
                warnings.push(
                    "This PC's GPU doesn't support 10-bit HEVC or AV1 decoding for HDR streaming."
                        .to_string(),
                );
            } else if formats.mask_by_server_codec_modes(scm & SCM_MASK_10BIT) == 0 {
                warnings.push("Your host PC doesn't support HDR streaming.".to_string());
                formats.remove_by_mask(VIDEO_FORMAT_MASK_10BIT);
            } else if formats.contains_any(VIDEO_FORMAT_MASK_10BIT)
                && formats.mask_by_server_codec_modes(scm) & VIDEO_FORMAT_MASK_10BIT == 0
            {
                warnings.push("Your host PC and client PC don't support the same HDR video codecs.".to_string());
                formats.remove_by_mask(VIDEO_FORMAT_MASK_10BIT);
            }
        }

        if self.prefs.enable_yuv444 {
            if scm & SCM_MASK_YUV444 == 0 {
                warnings.push("Your host PC doesn't support YUV 4:4:4 streaming.".to_string());
                formats.remove_by_mask(VIDEO_FORMAT_MASK_YUV444);
            } else {
                // Strike anything the host cannot encode, then make sure a
                // forced-hardware client doesn't land on an undecodable
                // 4:4:4 profile.
                let encodable = formats.mask_by_server_codec_modes(scm);
                formats.remove_by_mask(!encodable);

                if formats
                    .front()
                    .map(|f| f & VIDEO_FORMAT_MASK_YUV444 == 0)
                    .unwrap_or(false)
                {
                    warnings.push(
                        "Your host PC doesn't support YUV 4:4:4 streaming for selected video codec."
                            .to_string(),
                    );
                } else if self.prefs.video_decoder_selection
                    == VideoDecoderSelection::ForceHardware
                {
                    while let Some(front) = formats.front() {
                        if front & VIDEO_FORMAT_MASK_YUV444 == 0 {
                            break;
                        }
                        if self
                            .probe
                            .availability(front, config.width, config.height, config.fps)
                            == DecoderAvailability::Hardware
                        {
                            break;
                        }
                        formats.remove_first();
                    }
                    if formats
                        .front()
                        .map(|f| f & VIDEO_FORMAT_MASK_YUV444 == 0)
                        .unwrap_or(true)
                    {
                        warnings.push(
                            "This PC's GPU doesn't support YUV 4:4:4 decoding for selected video codec."
                                .to_string(),
                        );
                    }
                }
            }
        }

        // 4K needs GFE 3.x on the host side.
        if config.width >= 3840
            && (self.host.gfe_version.is_empty() || self.host.gfe_version.starts_with("2."))
        {
            warnings
                .push("GeForce Experience 3.0 or higher is required for 4K streaming.".to_string());
            config.width = 1920;
            config.height = 1080;
        }

        // Gracefully degrade surround to stereo, then warn if audio is
        // unavailable entirely.
        let mut audio_ok = self.audio.test_config(config.audio_configuration);
        if !audio_ok && config.audio_configuration.channel_count() > 2 {
            if self.audio.test_config(AudioConfiguration::Stereo) {
                config.audio_configuration = AudioConfiguration::Stereo;
                audio_ok = true;
                warnings.push(
                    "Your selected surround sound setting is not supported by the current audio device."
                        .to_string(),
                );
            }
        }
        if !audio_ok {
            warnings.push(
                "Failed to open audio device. Audio will be unavailable during this session."
                    .to_string(),
            );
        }

        // Codec of last resort.
        if formats.is_empty() {
            formats.push(VIDEO_FORMAT_H264);
        }

        // NVENC cannot encode above 4096 pixels per dimension with H.264 on
        // any generation, nor with HEVC before Pascal. HEVC Main10 support
        // stands in for the Pascal+ check. Non-Nvidia hosts make no such
        // promise either way, so they skip this.
        if (config.width > 4096 || config.height > 4096) && self.host.is_nvidia_server_software() {
            if self.host.max_luma_pixels_hevc == 0 || scm & SCM_HEVC_MAIN10 == 0 {
                return Err(NegotiationError::ResolutionUnsupportedByHost.into());
            }
            if !formats.contains_any(!VIDEO_FORMAT_MASK_H264) {
                return Err(NegotiationError::ResolutionRequiresModernCodec.into());
            }
        }

        if self.prefs.video_decoder_selection == VideoDecoderSelection::ForceHardware
            && !formats.contains_any(VIDEO_FORMAT_MASK_10BIT)
        {
            if let Some(front) = formats.front() {
                if self
                    .probe
                    .availability(front, config.width, config.height, config.fps)
                    != DecoderAvailability::Hardware
                {
                    return Err(NegotiationError::ForcedHardwareUnavailable(front).into());
                }
            }
        }

        Ok(())
    }
}
