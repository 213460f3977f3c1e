//! # nvstream-session
//!
//! The session orchestrator: codec/HDR negotiation against host and client
//! capabilities, auto-resolution, stream-config assembly, frame pacing
//! against display refresh, the session event loop, and the update-manifest
//! checker.

pub mod config;
pub mod launch;
pub mod negotiate;
pub mod pacer;
pub mod session;
pub mod updater;

pub use config::{
    encryption_flags, resolve_dimensions, ClientCapabilities, DisplayInfo, Preferences,
    VideoCodecConfig, VideoDecoderSelection,
};
pub use launch::{launch_verb, start_app, LaunchRequest};
pub use negotiate::{AudioSink, DecoderAvailability, DecoderProbe, NegotiationResult, Negotiator};
pub use pacer::{
    monotonic_micros, should_disable_vsync, Frame, FrameRenderer, Pacer, VideoStats,
    VideoStatsSnapshot, VsyncSource, MAX_QUEUED_FRAMES, RENDERER_ATTRIBUTE_NO_BUFFERING,
    TIMER_SLACK_MS,
};
pub use session::{
    DecoderFactory, PortProber, Session, SessionEvent, SessionNotification, StreamConnection,
    VideoDecoder,
};
pub use updater::{
    available_update, is_newer_version, parse_manifest, probe_file_server, select_entry,
    ClientPlatform, UpdateEntry, FILE_SERVER_PROBE_TIMEOUT,
};
