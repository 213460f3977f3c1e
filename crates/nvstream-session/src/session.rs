//! The session event loop and lifecycle.
//!
//! One loop multiplexes protocol callbacks, window events, and user
//! actions. Teardown always runs through a deferred cleanup step that stops
//! the connection before any restart signal is emitted, and a process-wide
//! semaphore guarantees at most one active session.

use crate::config::Preferences;
use std::ops::ControlFlow;
use std::sync::{Mutex, OnceLock};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

/// A live decoder instance, owned under the session's decoder mutex.
pub trait VideoDecoder: Send {
    /// Request a decoder-refresh keyframe from the host.
    fn request_idr_frame(&mut self);
}

/// Chooses a decoder for the current display attributes.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, display_refresh_rate: i32) -> Option<Box<dyn VideoDecoder>>;
}

/// The established streaming connection, stopped during deferred cleanup.
pub trait StreamConnection: Send {
    fn stop(&mut self);
}

/// Probes which streaming ports the network blocks, for annotating stage
/// failures.
pub trait PortProber: Send + Sync {
    fn failing_ports(&self, stage_error_code: i32) -> String;
}

/// Events fed into the session loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// A connection bring-up stage is starting.
    StageStarting { stage: String },
    /// A bring-up stage failed.
    StageFailed { stage: String, error_code: i32 },
    /// Streaming is established.
    ConnectionStarted,
    /// The connection ended; error code 0 is a graceful termination.
    ConnectionTerminated { error_code: i32 },
    /// The host's desktop resolution changed mid-stream.
    HostDesktopResolutionChanged { width: i32, height: i32 },
    /// The user answered a resolution-change dialog.
    DialogResponse { generation: u64, restart: bool },
    /// The session window gained or lost focus.
    WindowFocusChanged { focused: bool },
    /// The window moved to a display with a different refresh rate.
    DisplayChanged { refresh_rate: i32 },
    /// The user asked for a session restart.
    RestartRequested,
    /// The user quit the session.
    Quit,
}

/// Notifications emitted to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotification {
    StageStarting {
        stage: String,
    },
    StageFailed {
        stage: String,
        error_code: i32,
        failing_ports: String,
    },
    /// Ask the user whether to restart for a new host resolution. Responses
    /// must echo `generation`; stale generations are ignored.
    ShowResolutionDialog {
        generation: u64,
        width: i32,
        height: i32,
    },
    AudioMuted(bool),
    /// Emitted only after the connection is fully down.
    SessionRestarting,
    SessionFinished {
        unexpected_termination: bool,
    },
}

fn active_session_slot() -> &'static Semaphore {
    static SLOT: OnceLock<Semaphore> = OnceLock::new();
    SLOT.get_or_init(|| Semaphore::new(1))
}

pub struct Session {
    prefs: Preferences,
    is_auto_resolution: bool,
    dialog_generation: u64,
    /// Termination is assumed unexpected until streaming begins.
    unexpected_termination: bool,
    restart_pending: bool,
    audio_muted: bool,
    decoder: Mutex<Option<Box<dyn VideoDecoder>>>,
    decoder_factory: Box<dyn DecoderFactory>,
    port_prober: Option<Box<dyn PortProber>>,
    notifications: mpsc::UnboundedSender<SessionNotification>,
}

impl Session {
    pub fn new(
        prefs: Preferences,
        decoder_factory: Box<dyn DecoderFactory>,
        port_prober: Option<Box<dyn PortProber>>,
        notifications: mpsc::UnboundedSender<SessionNotification>,
    ) -> Self {
        Self {
            is_auto_resolution: prefs.is_auto_resolution(),
            prefs,
            dialog_generation: 0,
            unexpected_termination: true,
            restart_pending: false,
            audio_muted: false,
            decoder: Mutex::new(None),
            decoder_factory,
            port_prober,
            notifications,
        }
    }

    /// Run the loop until the session ends, then perform deferred cleanup:
    /// stop the connection, and only afterwards signal restart/finish.
    /// Holds the process-wide session slot for the whole duration.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        connection: Box<dyn StreamConnection>,
    ) {
        let Ok(_permit) = active_session_slot().acquire().await else {
            return;
        };
        info!("Session event loop starting");

        while let Some(event) = events.recv().await {
            if self.handle_event(event).is_break() {
                break;
            }
        }

        // Deferred cleanup off the event loop; the connection must be fully
        // down before a restart is announced.
        let mut connection = connection;
        let _ = tokio::task::spawn_blocking(move || connection.stop()).await;

        if self.restart_pending {
            info!("Session restarting");
            let _ = self.notifications.send(SessionNotification::SessionRestarting);
        } else {
            info!(
                unexpected = self.unexpected_termination,
                "Session finished"
            );
            let _ = self.notifications.send(SessionNotification::SessionFinished {
                unexpected_termination: self.unexpected_termination,
            });
        }
    }

    fn handle_event(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::StageStarting { stage } => {
                let _ = self
                    .notifications
                    .send(SessionNotification::StageStarting { stage });
                ControlFlow::Continue(())
            }

            SessionEvent::StageFailed { stage, error_code } => {
                // Probe connectivity now so the failure arrives annotated
                // with the ports the network appears to block.
                let failing_ports = self
                    .port_prober
                    .as_ref()
                    .map(|prober| prober.failing_ports(error_code))
                    .unwrap_or_default();
                let _ = self.notifications.send(SessionNotification::StageFailed {
                    stage,
                    error_code,
                    failing_ports,
                });
                ControlFlow::Break(())
            }

            SessionEvent::ConnectionStarted => {
                self.unexpected_termination = false;
                ControlFlow::Continue(())
            }

            SessionEvent::ConnectionTerminated { error_code } => {
                if error_code != 0 {
                    self.unexpected_termination = true;
                }
                ControlFlow::Break(())
            }

            SessionEvent::HostDesktopResolutionChanged { width, height } => {
                // Only meaningful in Auto mode, where a restart would adopt
                // the new size.
                if self.is_auto_resolution {
                    self.dialog_generation += 1;
                    let _ = self
                        .notifications
                        .send(SessionNotification::ShowResolutionDialog {
                            generation: self.dialog_generation,
                            width,
                            height,
                        });
                }
                ControlFlow::Continue(())
            }

            SessionEvent::DialogResponse {
                generation,
                restart,
            } => {
                if generation != self.dialog_generation {
                    debug!(
                        generation,
                        current = self.dialog_generation,
                        "Ignoring stale resolution dialog response"
                    );
                    return ControlFlow::Continue(());
                }
                // Consume this generation so duplicate responses are stale.
                self.dialog_generation += 1;
                if restart {
                    self.restart_pending = true;
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }

            SessionEvent::WindowFocusChanged { focused } => {
                if self.prefs.mute_on_focus_loss {
                    self.audio_muted = !focused;
                    let _ = self
                        .notifications
                        .send(SessionNotification::AudioMuted(self.audio_muted));
                }
                ControlFlow::Continue(())
            }

            SessionEvent::DisplayChanged { refresh_rate } => {
                self.recreate_decoder(refresh_rate);
                ControlFlow::Continue(())
            }

            SessionEvent::RestartRequested => {
                self.restart_pending = true;
                ControlFlow::Break(())
            }

            SessionEvent::Quit => ControlFlow::Break(()),
        }
    }

    /// Swap the decoder for new display attributes. The mutex keeps
    /// protocol callbacks from touching a half-torn-down decoder; the IDR
    /// request recovers the stream on the fresh instance.
    fn recreate_decoder(&self, refresh_rate: i32) {
        let mut decoder = self.decoder.lock().unwrap();
        decoder.take();
        *decoder = self.decoder_factory.create(refresh_rate);
        if let Some(decoder) = decoder.as_mut() {
            decoder.request_idr_frame();
        }
    }

    pub fn is_audio_muted(&self) -> bool {
        self.audio_muted
    }
}
