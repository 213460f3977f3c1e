//! Leaf extraction from host XML responses.
//!
//! Host responses are small flat documents under a `root` element whose
//! `status_code` attribute signals success. These helpers pull out named
//! leaves without building a DOM.

use nvstream_core::{DisplayMode, HostProbe, HostProtocolError, ParseError};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Extract the text of the first leaf element named `tag`.
pub fn xml_string(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut inside = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                inside = e.name().as_ref() == tag.as_bytes();
            }
            Ok(Event::Text(ref t)) if inside => {
                return t.unescape().ok().map(|s| s.into_owned());
            }
            Ok(Event::End(_)) => {
                if inside {
                    // Empty element: <tag></tag> yields an empty string.
                    return Some(String::new());
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Extract a leaf as hex-decoded bytes. Returns `None` when the leaf is
/// absent and an error when present but not valid hex.
pub fn xml_hex_bytes(xml: &str, tag: &str) -> Result<Option<Vec<u8>>, ParseError> {
    match xml_string(xml, tag) {
        None => Ok(None),
        Some(text) => hex::decode(text.trim())
            .map(Some)
            .map_err(|_| ParseError::InvalidHex(tag.to_string())),
    }
}

/// Check the `root@status_code` attribute, raising a host protocol error for
/// anything but 200. The host puts a human-readable cause in
/// `status_message`.
pub fn verify_response_status(xml: &str) -> Result<(), HostProtocolError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() != b"root" {
                    continue;
                }
                let mut status_code = 200;
                let mut status_message = String::new();
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    match attr.key.as_ref() {
                        b"status_code" => status_code = value.trim().parse().unwrap_or(-1),
                        b"status_message" => status_message = value,
                        _ => {}
                    }
                }
                if status_code == 200 {
                    return Ok(());
                }
                // Certain hosts report 5031020 for the 503 condition; the
                // meaningful part is the leading three digits.
                if status_message.is_empty() {
                    status_message = format!("Host returned status {}", status_code);
                }
                return Err(HostProtocolError::new(status_code, status_message));
            }
            Ok(Event::Eof) => {
                return Err(HostProtocolError::new(
                    -1,
                    "Response had no root element".to_string(),
                ));
            }
            Err(e) => {
                return Err(HostProtocolError::new(-1, format!("Malformed response: {}", e)));
            }
            _ => {}
        }
        buf.clear();
    }
}

fn leaf_i32(xml: &str, tag: &str) -> i32 {
    xml_string(xml, tag)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn leaf_i64(xml: &str, tag: &str) -> i64 {
    xml_string(xml, tag)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Parse a serverinfo document into a probe snapshot.
pub fn parse_server_info(xml: &str) -> Result<HostProbe, ParseError> {
    let uuid = xml_string(xml, "uniqueid").ok_or(ParseError::MissingField("uniqueid"))?;
    if uuid.is_empty() {
        return Err(ParseError::MissingField("uniqueid"));
    }

    Ok(HostProbe {
        uuid,
        name: xml_string(xml, "hostname").unwrap_or_else(|| "UNKNOWN".to_string()),
        https_port: leaf_i32(xml, "HttpsPort") as u16,
        app_version: xml_string(xml, "appversion").unwrap_or_default(),
        gfe_version: xml_string(xml, "GfeVersion").unwrap_or_default(),
        gpu_model: xml_string(xml, "gputype").unwrap_or_default(),
        mac_address: xml_string(xml, "mac").unwrap_or_default(),
        current_game: leaf_i32(xml, "currentgame"),
        paired: leaf_i32(xml, "PairStatus") == 1,
        server_codec_mode_support: leaf_i64(xml, "ServerCodecModeSupport") as u32,
        max_luma_pixels_hevc: leaf_i64(xml, "MaxLumaPixelsHEVC"),
        display_modes: parse_display_modes(xml),
    })
}

/// Collect `<DisplayMode>` blocks from serverinfo.
fn parse_display_modes(xml: &str) -> Vec<DisplayMode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut modes = Vec::new();
    let mut buf = Vec::new();
    let mut in_mode = false;
    let mut current_tag: Vec<u8> = Vec::new();
    let mut width = 0;
    let mut height = 0;
    let mut refresh_rate = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"DisplayMode" {
                    in_mode = true;
                    width = 0;
                    height = 0;
                    refresh_rate = 0;
                } else if in_mode {
                    current_tag = e.name().as_ref().to_vec();
                }
            }
            Ok(Event::Text(ref t)) if in_mode => {
                if let Ok(text) = t.unescape() {
                    let value: i32 = text.trim().parse().unwrap_or(0);
                    match current_tag.as_slice() {
                        b"Width" => width = value,
                        b"Height" => height = value,
                        b"RefreshRate" => refresh_rate = value,
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"DisplayMode" {
                    in_mode = false;
                    if width > 0 && height > 0 {
                        modes.push(DisplayMode {
                            width,
                            height,
                            refresh_rate,
                        });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    modes
}

/// Parse the applist response into app entries. Box-art URLs are filled in
/// by the client, which knows the HTTPS base URL.
pub fn parse_app_list(xml: &str) -> Vec<(i32, String, bool)> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut apps = Vec::new();
    let mut buf = Vec::new();
    let mut in_app = false;
    let mut current_tag: Vec<u8> = Vec::new();
    let mut id = 0;
    let mut title = String::new();
    let mut hdr = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"App" {
                    in_app = true;
                    id = 0;
                    title.clear();
                    hdr = false;
                } else if in_app {
                    current_tag = e.name().as_ref().to_vec();
                }
            }
            Ok(Event::Text(ref t)) if in_app => {
                if let Ok(text) = t.unescape() {
                    match current_tag.as_slice() {
                        b"ID" => id = text.trim().parse().unwrap_or(0),
                        b"AppTitle" => title = text.into_owned(),
                        b"IsHdrSupported" => hdr = text.trim() == "1",
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"App" {
                    in_app = false;
                    if id != 0 {
                        apps.push((id, std::mem::take(&mut title), hdr));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    apps
}
