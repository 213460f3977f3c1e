//! Host record state and its serialized form.

use crate::address::HostAddress;
use crate::version::parse_quad;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairState {
    Unpaired,
    Paired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Online,
    Offline,
}

/// One entry of the host's application list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    pub id: i32,
    pub name: String,
    pub box_art_url: String,
    pub hdr_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMode {
    pub width: i32,
    pub height: i32,
    pub refresh_rate: i32,
}

/// Mutable host state. The owning registry wraps this in a per-record
/// reader/writer lock; the UUID lives outside as the immutable key.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub name: String,
    pub has_custom_name: bool,

    pub local_address: Option<HostAddress>,
    pub manual_address: Option<HostAddress>,
    pub ipv6_address: Option<HostAddress>,
    pub remote_address: Option<HostAddress>,
    /// The last address that successfully answered a probe. Always one of
    /// the four slots above.
    pub active_address: Option<HostAddress>,

    pub https_port: u16,
    pub app_version: String,
    pub gfe_version: String,
    pub gpu_model: String,
    pub mac_address: String,

    /// PEM of the pinned server certificate. Empty until paired.
    pub server_cert_pem: String,
    pub pair_state: PairState,
    pub reachability: Reachability,

    pub current_game: i32,
    pub pending_quit: bool,

    pub server_codec_mode_support: u32,
    pub max_luma_pixels_hevc: i64,
    pub display_modes: Vec<DisplayMode>,
    pub app_list: Vec<AppEntry>,
}

impl Default for PairState {
    fn default() -> Self {
        PairState::Unpaired
    }
}

impl Default for Reachability {
    fn default() -> Self {
        Reachability::Unknown
    }
}

/// A snapshot parsed out of one serverinfo response. Produced by the HTTP
/// layer, consumed by `HostState::update_from`.
#[derive(Debug, Clone, Default)]
pub struct HostProbe {
    pub uuid: String,
    pub name: String,
    pub https_port: u16,
    pub app_version: String,
    pub gfe_version: String,
    pub gpu_model: String,
    pub mac_address: String,
    pub current_game: i32,
    /// `PairStatus` leaf; only meaningful when the client also holds a
    /// pinned certificate for this host.
    pub paired: bool,
    pub server_codec_mode_support: u32,
    pub max_luma_pixels_hevc: i64,
    pub display_modes: Vec<DisplayMode>,
}

impl HostState {
    /// Host app generation, from the major component of the app version.
    pub fn server_major_version(&self) -> i32 {
        parse_quad(&self.app_version).first().copied().unwrap_or(0)
    }

    /// GFE 3.x shipped protocol generation 7; anything older cannot
    /// negotiate a modern stream.
    pub fn is_supported_server_version(&self) -> bool {
        self.server_major_version() >= 3
    }

    /// Hosts running NVIDIA server software report a GFE version; third
    /// party hosts leave it empty.
    pub fn is_nvidia_server_software(&self) -> bool {
        !self.gfe_version.is_empty()
    }

    /// All configured addresses in probe order, active address first,
    /// deduplicated.
    pub fn unique_addresses(&self) -> Vec<HostAddress> {
        let mut out: Vec<HostAddress> = Vec::new();
        for candidate in [
            &self.active_address,
            &self.local_address,
            &self.manual_address,
            &self.ipv6_address,
            &self.remote_address,
        ]
        .into_iter()
        .flatten()
        {
            if !out.contains(candidate) {
                out.push(candidate.clone());
            }
        }
        out
    }

    /// Merge a probe snapshot into this record. `via` is the address the
    /// probe answered on; it becomes the active address. Returns true when
    /// any serialized attribute or the reachability state changed.
    ///
    /// Name updates respect a user-assigned custom name. Capability fields
    /// only overwrite when the probe actually carried them, so an HTTP
    /// (unauthenticated) refresh never wipes HTTPS-only fields.
    pub fn update_from(&mut self, probe: &HostProbe, via: HostAddress) -> bool {
        let before = SerializedHost::from_state("", self, true);
        let was_online = self.reachability == Reachability::Online;

        if !self.has_custom_name && !probe.name.is_empty() {
            self.name = probe.name.clone();
        }
        if probe.https_port != 0 {
            self.https_port = probe.https_port;
        }
        if !probe.app_version.is_empty() {
            self.app_version = probe.app_version.clone();
        }
        if !probe.gfe_version.is_empty() {
            self.gfe_version = probe.gfe_version.clone();
        }
        if !probe.gpu_model.is_empty() {
            self.gpu_model = probe.gpu_model.clone();
        }
        if !probe.mac_address.is_empty() {
            self.mac_address = probe.mac_address.clone();
        }
        if probe.server_codec_mode_support != 0 {
            self.server_codec_mode_support = probe.server_codec_mode_support;
        }
        if probe.max_luma_pixels_hevc != 0 {
            self.max_luma_pixels_hevc = probe.max_luma_pixels_hevc;
        }
        if !probe.display_modes.is_empty() {
            self.display_modes = probe.display_modes.clone();
        }
        self.current_game = probe.current_game;
        self.pair_state = if probe.paired && !self.server_cert_pem.is_empty() {
            PairState::Paired
        } else {
            PairState::Unpaired
        };
        self.active_address = Some(via);
        self.reachability = Reachability::Online;

        let after = SerializedHost::from_state("", self, true);
        before != after || !was_online
    }

    /// Replace the cached app list; returns true if it changed.
    pub fn update_app_list(&mut self, apps: Vec<AppEntry>) -> bool {
        if self.app_list == apps {
            false
        } else {
            self.app_list = apps;
            true
        }
    }
}

/// The durable form of a host record, written to the persistence back-end.
/// Transient state (reachability, running game, pending quit) is excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedHost {
    pub uuid: String,
    pub name: String,
    pub has_custom_name: bool,
    pub local_address: Option<HostAddress>,
    pub manual_address: Option<HostAddress>,
    pub ipv6_address: Option<HostAddress>,
    pub remote_address: Option<HostAddress>,
    pub https_port: u16,
    pub server_cert_pem: String,
    pub app_version: String,
    pub gfe_version: String,
    pub gpu_model: String,
    pub mac_address: String,
    pub server_codec_mode_support: u32,
    pub max_luma_pixels_hevc: i64,
    pub display_modes: Vec<DisplayMode>,
    #[serde(default)]
    pub app_list: Vec<AppEntry>,
}

impl SerializedHost {
    pub fn from_state(uuid: &str, state: &HostState, include_app_list: bool) -> Self {
        Self {
            uuid: uuid.to_string(),
            name: state.name.clone(),
            has_custom_name: state.has_custom_name,
            local_address: state.local_address.clone(),
            manual_address: state.manual_address.clone(),
            ipv6_address: state.ipv6_address.clone(),
            remote_address: state.remote_address.clone(),
            https_port: state.https_port,
            server_cert_pem: state.server_cert_pem.clone(),
            app_version: state.app_version.clone(),
            gfe_version: state.gfe_version.clone(),
            gpu_model: state.gpu_model.clone(),
            mac_address: state.mac_address.clone(),
            server_codec_mode_support: state.server_codec_mode_support,
            max_luma_pixels_hevc: state.max_luma_pixels_hevc,
            display_modes: state.display_modes.clone(),
            app_list: if include_app_list {
                state.app_list.clone()
            } else {
                Vec::new()
            },
        }
    }

    /// Inflate a host state from its durable form. The pair state is derived
    /// from the presence of a pinned certificate; reachability starts
    /// unknown until the first probe answers.
    pub fn into_state(self) -> (String, HostState) {
        let pair_state = if self.server_cert_pem.is_empty() {
            PairState::Unpaired
        } else {
            PairState::Paired
        };
        let state = HostState {
            name: self.name,
            has_custom_name: self.has_custom_name,
            local_address: self.local_address,
            manual_address: self.manual_address,
            ipv6_address: self.ipv6_address,
            remote_address: self.remote_address,
            active_address: None,
            https_port: self.https_port,
            app_version: self.app_version,
            gfe_version: self.gfe_version,
            gpu_model: self.gpu_model,
            mac_address: self.mac_address,
            server_cert_pem: self.server_cert_pem,
            pair_state,
            reachability: Reachability::Unknown,
            current_game: 0,
            pending_quit: false,
            server_codec_mode_support: self.server_codec_mode_support,
            max_luma_pixels_hevc: self.max_luma_pixels_hevc,
            display_modes: self.display_modes,
            app_list: self.app_list,
        };
        (self.uuid, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(uuid: &str, name: &str) -> HostProbe {
        HostProbe {
            uuid: uuid.to_string(),
            name: name.to_string(),
            https_port: 47984,
            app_version: "7.1.431.0".to_string(),
            gfe_version: "3.23.0.74".to_string(),
            gpu_model: "NVIDIA GeForce RTX 3080".to_string(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            current_game: 0,
            paired: false,
            server_codec_mode_support: 0x10303,
            max_luma_pixels_hevc: 1869449984,
            display_modes: vec![DisplayMode {
                width: 1920,
                height: 1080,
                refresh_rate: 60,
            }],
        }
    }

    fn addr(a: &str) -> HostAddress {
        HostAddress::new(a, 47989)
    }

    mod unique_addresses {
        use super::*;

        #[test]
        fn active_address_comes_first_and_is_deduped() {
            let mut state = HostState::default();
            state.local_address = Some(addr("192.168.1.50"));
            state.manual_address = Some(addr("192.168.1.50"));
            state.ipv6_address = Some(addr("2600:1700::4"));
            state.active_address = Some(addr("2600:1700::4"));

            let unique = state.unique_addresses();
            assert_eq!(unique, vec![addr("2600:1700::4"), addr("192.168.1.50")]);
        }

        #[test]
        fn active_address_is_always_a_member() {
            let mut state = HostState::default();
            state.local_address = Some(addr("10.0.0.2"));
            state.active_address = Some(addr("10.0.0.2"));
            assert!(state.unique_addresses().contains(state.active_address.as_ref().unwrap()));
        }
    }

    mod update_from {
        use super::*;

        #[test]
        fn probe_onlines_and_sets_active_address() {
            let mut state = HostState::default();
            let changed = state.update_from(&probe("u1", "GAMINGPC"), addr("192.168.1.50"));
            assert!(changed);
            assert_eq!(state.reachability, Reachability::Online);
            assert_eq!(state.active_address, Some(addr("192.168.1.50")));
            assert_eq!(state.name, "GAMINGPC");
        }

        #[test]
        fn identical_probe_reports_no_change() {
            let mut state = HostState::default();
            state.update_from(&probe("u1", "GAMINGPC"), addr("192.168.1.50"));
            let changed = state.update_from(&probe("u1", "GAMINGPC"), addr("192.168.1.50"));
            assert!(!changed);
        }

        #[test]
        fn custom_name_is_sticky() {
            let mut state = HostState::default();
            state.name = "den pc".to_string();
            state.has_custom_name = true;
            state.update_from(&probe("u1", "GAMINGPC"), addr("192.168.1.50"));
            assert_eq!(state.name, "den pc");
        }

        #[test]
        fn paired_requires_pinned_cert() {
            let mut state = HostState::default();
            let mut p = probe("u1", "GAMINGPC");
            p.paired = true;

            state.update_from(&p, addr("192.168.1.50"));
            assert_eq!(state.pair_state, PairState::Unpaired);

            state.server_cert_pem = "-----BEGIN CERTIFICATE-----".to_string();
            state.update_from(&p, addr("192.168.1.50"));
            assert_eq!(state.pair_state, PairState::Paired);
        }

        #[test]
        fn empty_probe_fields_do_not_wipe_known_values() {
            let mut state = HostState::default();
            state.update_from(&probe("u1", "GAMINGPC"), addr("192.168.1.50"));

            let mut sparse = HostProbe::default();
            sparse.uuid = "u1".to_string();
            state.update_from(&sparse, addr("192.168.1.50"));

            assert_eq!(state.gpu_model, "NVIDIA GeForce RTX 3080");
            assert_eq!(state.https_port, 47984);
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn round_trip_is_byte_identical() {
            let mut state = HostState::default();
            state.update_from(&probe("u1", "GAMINGPC"), addr("192.168.1.50"));
            state.server_cert_pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n".to_string();
            state.app_list = vec![AppEntry {
                id: 1,
                name: "Desktop".to_string(),
                box_art_url: "https://192.168.1.50:47984/appasset?appid=1".to_string(),
                hdr_supported: true,
            }];

            let ser = SerializedHost::from_state("u1", &state, true);
            let json = serde_json::to_string(&ser).unwrap();
            let back: SerializedHost = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&back).unwrap();
            assert_eq!(json, json2);

            let (uuid, restored) = back.into_state();
            assert_eq!(uuid, "u1");
            assert_eq!(restored.pair_state, PairState::Paired);
            assert_eq!(restored.reachability, Reachability::Unknown);
            assert_eq!(
                SerializedHost::from_state("u1", &restored, true),
                SerializedHost::from_state("u1", &state, true)
            );
        }

        #[test]
        fn transient_fields_are_not_serialized() {
            let mut state = HostState::default();
            state.update_from(&probe("u1", "GAMINGPC"), addr("192.168.1.50"));
            state.current_game = 1337;
            state.pending_quit = true;

            let a = SerializedHost::from_state("u1", &state, true);
            state.current_game = 0;
            state.pending_quit = false;
            state.reachability = Reachability::Offline;
            let b = SerializedHost::from_state("u1", &state, true);
            assert_eq!(a, b);
        }
    }

    mod versions {
        use super::*;

        #[test]
        fn server_generation_comes_from_app_version() {
            let mut state = HostState::default();
            state.app_version = "7.1.431.0".to_string();
            assert_eq!(state.server_major_version(), 7);
            assert!(state.is_supported_server_version());

            state.app_version = "2.11.2".to_string();
            assert!(!state.is_supported_server_version());
        }

        #[test]
        fn nvidia_detection_uses_gfe_version() {
            let mut state = HostState::default();
            assert!(!state.is_nvidia_server_software());
            state.gfe_version = "3.23.0.74".to_string();
            assert!(state.is_nvidia_server_software());
        }
    }
}
