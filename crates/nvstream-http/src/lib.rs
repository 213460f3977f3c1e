//! # nvstream-http
//!
//! The GameStream control-channel client: XML-over-GET commands against a
//! host's HTTP and HTTPS endpoints, with byte-equality certificate pinning
//! on the HTTPS side.

pub mod client;
pub mod tls;
pub mod xml;

pub use client::{BaseUrl, LogLevel, NvHttpClient, CLIENT_UNIQUE_ID};
pub use xml::{parse_app_list, parse_server_info, verify_response_status, xml_hex_bytes, xml_string};
