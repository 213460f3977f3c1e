//! One-shot STUN binding request for learning the external IPv4 address.
//!
//! Issued at most once per newly added non-mDNS host on an RFC 1918
//! address. Only the binding request/response with (XOR-)MAPPED-ADDRESS is
//! implemented; anything fancier is out of scope.

use nvstream_core::{Result, TransportError, TransportErrorKind};
use rand::RngCore;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

pub const DEFAULT_STUN_SERVER: &str = "stun.moonlight-stream.org";
pub const DEFAULT_STUN_PORT: u16 = 3478;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Ask a STUN server for our reflexive IPv4 address.
pub async fn find_external_ipv4(server: &str, port: u16, timeout: Duration) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TransportError::new(TransportErrorKind::Io, e.to_string()))?;
    socket
        .connect((server, port))
        .await
        .map_err(|e| TransportError::new(TransportErrorKind::Dns, e.to_string()))?;

    let mut transaction_id = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut transaction_id);
    let request = encode_binding_request(&transaction_id);

    socket
        .send(&request)
        .await
        .map_err(|e| TransportError::new(TransportErrorKind::Io, e.to_string()))?;

    let mut response = [0u8; 512];
    let len = tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| TransportError::timeout("STUN response"))?
        .map_err(|e| TransportError::new(TransportErrorKind::Io, e.to_string()))?;

    let addr = parse_binding_response(&response[..len], &transaction_id)?;
    debug!("STUN reported external address {}", addr);
    Ok(addr)
}

fn encode_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut message = Vec::with_capacity(20);
    message.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    message.extend_from_slice(&0u16.to_be_bytes()); // no attributes
    message.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    message.extend_from_slice(transaction_id);
    message
}

fn parse_binding_response(data: &[u8], transaction_id: &[u8; 12]) -> Result<Ipv4Addr> {
    if data.len() < 20 {
        return Err(protocol_error("response shorter than a STUN header"));
    }

    let message_type = u16::from_be_bytes([data[0], data[1]]);
    let message_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    if message_type != BINDING_SUCCESS {
        return Err(protocol_error("not a binding success response"));
    }
    if cookie != MAGIC_COOKIE {
        return Err(protocol_error("bad magic cookie"));
    }
    if &data[8..20] != transaction_id {
        return Err(protocol_error("transaction id mismatch"));
    }
    if data.len() < 20 + message_len {
        return Err(protocol_error("truncated attributes"));
    }

    let mut offset = 20;
    let end = 20 + message_len;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value = &data[offset + 4..(offset + 4 + attr_len).min(end)];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS if value.len() >= 8 && value[1] == 0x01 => {
                let xored = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
                return Ok(Ipv4Addr::from(xored ^ MAGIC_COOKIE));
            }
            ATTR_MAPPED_ADDRESS if value.len() >= 8 && value[1] == 0x01 => {
                return Ok(Ipv4Addr::new(value[4], value[5], value[6], value[7]));
            }
            _ => {}
        }

        // Attributes are 32-bit aligned.
        offset += 4 + attr_len + ((4 - attr_len % 4) % 4);
    }

    Err(protocol_error("no mapped address attribute"))
}

fn protocol_error(message: &str) -> nvstream_core::Error {
    TransportError::new(TransportErrorKind::Io, format!("STUN: {}", message)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_attr(
        transaction_id: &[u8; 12],
        attr_type: u16,
        value: &[u8],
    ) -> Vec<u8> {
        let attr_len = value.len() as u16;
        let padded = value.len() + ((4 - value.len() % 4) % 4);
        let mut message = Vec::new();
        message.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        message.extend_from_slice(&((4 + padded) as u16).to_be_bytes());
        message.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        message.extend_from_slice(transaction_id);
        message.extend_from_slice(&attr_type.to_be_bytes());
        message.extend_from_slice(&attr_len.to_be_bytes());
        message.extend_from_slice(value);
        message.resize(message.len() + (padded - value.len()), 0);
        message
    }

    #[test]
    fn request_has_fixed_header() {
        let tid = [7u8; 12];
        let request = encode_binding_request(&tid);
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..], &tid);
    }

    #[test]
    fn xor_mapped_address_is_unmasked() {
        let tid = [3u8; 12];
        let external = Ipv4Addr::new(203, 0, 113, 7);
        let xored = u32::from(external) ^ MAGIC_COOKIE;
        let port_xored = 47989u16 ^ 0x2112;

        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&port_xored.to_be_bytes());
        value.extend_from_slice(&xored.to_be_bytes());

        let response = response_with_attr(&tid, ATTR_XOR_MAPPED_ADDRESS, &value);
        assert_eq!(parse_binding_response(&response, &tid).unwrap(), external);
    }

    #[test]
    fn plain_mapped_address_is_accepted() {
        let tid = [9u8; 12];
        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&47989u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 23]);

        let response = response_with_attr(&tid, ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(
            parse_binding_response(&response, &tid).unwrap(),
            Ipv4Addr::new(198, 51, 100, 23)
        );
    }

    #[test]
    fn transaction_id_mismatch_is_rejected() {
        let tid = [1u8; 12];
        let other = [2u8; 12];
        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&47989u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 23]);

        let response = response_with_attr(&tid, ATTR_MAPPED_ADDRESS, &value);
        assert!(parse_binding_response(&response, &other).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let tid = [1u8; 12];
        assert!(parse_binding_response(&[0u8; 4], &tid).is_err());
        assert!(parse_binding_response(&[0u8; 24], &tid).is_err());
    }
}
