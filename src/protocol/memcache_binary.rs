//! Memcache binary protocol, grounded on `protocol.cpp`'s
//! `memcache_binary_protocol` and the `protocol_binary_*` header layout
//! it builds on. The 24-byte request/response header shape is as defined
//! by the memcached binary protocol spec; only the opcodes this codec
//! issues (GET, SET, SASL_AUTH) are named.

use bytes::{Buf, BufMut, BytesMut};

use super::ParsedResponse;
use crate::errors::EngineError;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

const OPCODE_GET: u8 = 0x00;
const OPCODE_SET: u8 = 0x01;
const OPCODE_SASL_AUTH: u8 = 0x21;

const STATUS_SUCCESS: u16 = 0x0000;
const STATUS_AUTH_ERROR: u16 = 0x0020;
const STATUS_AUTH_CONTINUE: u16 = 0x0021;
const STATUS_UNKNOWN_COMMAND: u16 = 0x0081;
const STATUS_NOT_SUPPORTED: u16 = 0x0083;
const STATUS_EBUSY: u16 = 0x0085;

const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MState {
    Initial,
    ReadBody,
}

struct ResponseHeader {
    status: u16,
    keylen: u16,
    extlen: u8,
    bodylen: u32,
}

pub struct MemcacheBinaryState {
    state: MState,
    header: Option<ResponseHeader>,
    response_len: usize,
}

impl MemcacheBinaryState {
    pub fn new() -> Self {
        Self { state: MState::Initial, header: None, response_len: 0 }
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        STATUS_SUCCESS => "PROTOCOL_BINARY_RESPONSE_SUCCESS",
        0x0001 => "PROTOCOL_BINARY_RESPONSE_KEY_ENOENT",
        0x0002 => "PROTOCOL_BINARY_RESPONSE_KEY_EEXISTS",
        0x0003 => "PROTOCOL_BINARY_RESPONSE_E2BIG",
        0x0004 => "PROTOCOL_BINARY_RESPONSE_EINVAL",
        0x0005 => "PROTOCOL_BINARY_RESPONSE_NOT_STORED",
        0x0006 => "PROTOCOL_BINARY_RESPONSE_DELTA_BADVAL",
        0x0007 => "PROTOCOL_BINARY_RESPONSE_NOT_MY_VBUCKET",
        STATUS_AUTH_ERROR => "PROTOCOL_BINARY_RESPONSE_AUTH_ERROR",
        STATUS_AUTH_CONTINUE => "PROTOCOL_BINARY_RESPONSE_AUTH_CONTINUE",
        STATUS_UNKNOWN_COMMAND => "PROTOCOL_BINARY_RESPONSE_UNKNOWN_COMMAND",
        0x0082 => "PROTOCOL_BINARY_RESPONSE_ENOMEM",
        STATUS_NOT_SUPPORTED => "PROTOCOL_BINARY_RESPONSE_NOT_SUPPORTED",
        0x0084 => "PROTOCOL_BINARY_RESPONSE_EINTERNAL",
        STATUS_EBUSY => "PROTOCOL_BINARY_RESPONSE_EBUSY",
        0x0086 => "PROTOCOL_BINARY_RESPONSE_ETMPFAIL",
        _ => "PROTOCOL_BINARY_RESPONSE_UNKNOWN",
    }
}

pub fn parse_one(
    state: &mut MemcacheBinaryState,
    buf: &mut BytesMut,
    keep_value: bool,
    conn_id: usize,
) -> Result<Option<ParsedResponse>, EngineError> {
    loop {
        match state.state {
            MState::Initial => {
                if buf.len() < HEADER_LEN {
                    return Ok(None);
                }
                if buf[0] != MAGIC_RESPONSE {
                    return Err(EngineError::Parse {
                        conn_id,
                        state: "memcache_binary_initial",
                        consumed: 0,
                        preview: format!("bad magic byte {:#x}", buf[0]),
                    });
                }
                let keylen = u16::from_be_bytes([buf[2], buf[3]]);
                let extlen = buf[4];
                let status = u16::from_be_bytes([buf[6], buf[7]]);
                let bodylen = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
                buf.advance(HEADER_LEN);

                state.response_len = HEADER_LEN;
                state.header = Some(ResponseHeader { status, keylen, extlen, bodylen });

                if bodylen > 0 {
                    state.state = MState::ReadBody;
                } else {
                    let is_error = is_error_status(status);
                    let hits = if status == STATUS_SUCCESS { 1 } else { 0 };
                    state.state = MState::Initial;
                    return Ok(Some(ParsedResponse {
                        status: status_text(status).to_string(),
                        is_error,
                        hits,
                        total_len: state.response_len,
                        value: None,
                        tree: None,
                    }));
                }
            }
            MState::ReadBody => {
                let header = state.header.as_ref().expect("header set before ReadBody");
                let bodylen = header.bodylen as usize;
                if buf.len() < bodylen {
                    return Ok(None);
                }
                let skip = header.extlen as usize + header.keylen as usize;
                let value_len = bodylen.saturating_sub(skip);
                buf.advance(skip);
                let value = if keep_value {
                    Some(buf[..value_len].to_vec())
                } else {
                    None
                };
                buf.advance(value_len);

                let status = header.status;
                let is_error = is_error_status(status);
                let hits = if status == STATUS_SUCCESS { 1 } else { 0 };
                state.response_len += bodylen;
                let total_len = state.response_len;
                state.state = MState::Initial;
                return Ok(Some(ParsedResponse {
                    status: status_text(status).to_string(),
                    is_error,
                    hits,
                    total_len,
                    value,
                    tree: None,
                }));
            }
        }
    }
}

fn is_error_status(status: u16) -> bool {
    matches!(
        status,
        STATUS_AUTH_ERROR | STATUS_AUTH_CONTINUE | STATUS_UNKNOWN_COMMAND | STATUS_NOT_SUPPORTED | STATUS_EBUSY
    )
}

fn write_header(
    out: &mut BytesMut,
    opcode: u8,
    keylen: u16,
    extlen: u8,
    bodylen: u32,
) {
    out.put_u8(MAGIC_REQUEST);
    out.put_u8(opcode);
    out.put_u16(keylen);
    out.put_u8(extlen);
    out.put_u8(0); // data type
    out.put_u16(0); // vbucket id / reserved
    out.put_u32(bodylen);
    out.put_u32(0); // opaque
    out.put_u64(0); // cas
}

pub fn encode_set(out: &mut BytesMut, key: &[u8], value: &[u8], expiry: u32) {
    let extlen = 8u8; // flags + expiration
    let bodylen = extlen as u32 + key.len() as u32 + value.len() as u32;
    write_header(out, OPCODE_SET, key.len() as u16, extlen, bodylen);
    out.put_u32(0); // flags
    out.put_u32(expiry);
    out.put_slice(key);
    out.put_slice(value);
}

pub fn encode_get(out: &mut BytesMut, key: &[u8]) {
    write_header(out, OPCODE_GET, key.len() as u16, 0, key.len() as u32);
    out.put_slice(key);
}

pub fn encode_sasl_auth(out: &mut BytesMut, credentials: &str) {
    let (user, passwd) = credentials.split_once(':').unwrap_or((credentials, ""));
    let mechanism = b"PLAIN";
    let bodylen = mechanism.len() + 1 + user.len() + 1 + passwd.len();
    write_header(out, OPCODE_SASL_AUTH, mechanism.len() as u16, 0, bodylen as u32);
    out.put_slice(mechanism);
    out.put_u8(0);
    out.put_slice(user.as_bytes());
    out.put_u8(0);
    out.put_slice(passwd.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_header(status: u16, bodylen: u32, extlen: u8, keylen: u16) -> Vec<u8> {
        let mut h = vec![MAGIC_RESPONSE, OPCODE_GET];
        h.extend_from_slice(&keylen.to_be_bytes());
        h.push(extlen);
        h.push(0);
        h.extend_from_slice(&status.to_be_bytes());
        h.extend_from_slice(&bodylen.to_be_bytes());
        h.extend_from_slice(&0u32.to_be_bytes());
        h.extend_from_slice(&0u64.to_be_bytes());
        h
    }

    #[test]
    fn success_with_no_body_completes_immediately() {
        let mut state = MemcacheBinaryState::new();
        let mut buf = BytesMut::from(&response_header(STATUS_SUCCESS, 0, 0, 0)[..]);
        let resp = parse_one(&mut state, &mut buf, false, 0).unwrap().unwrap();
        assert!(!resp.is_error);
        assert_eq!(resp.hits, 1);
    }

    #[test]
    fn get_hit_strips_extras_and_returns_value() {
        let mut state = MemcacheBinaryState::new();
        let mut header = response_header(STATUS_SUCCESS, 4 + 5, 4, 0);
        header.extend_from_slice(&[0, 0, 0, 0]); // flags extra
        header.extend_from_slice(b"hello");
        let mut buf = BytesMut::from(&header[..]);
        let resp = parse_one(&mut state, &mut buf, true, 0).unwrap().unwrap();
        assert_eq!(resp.value.as_deref(), Some(&b"hello"[..]));
        assert_eq!(resp.hits, 1);
    }

    #[test]
    fn key_not_found_is_not_an_error_but_not_a_hit() {
        let mut state = MemcacheBinaryState::new();
        let mut buf = BytesMut::from(&response_header(0x0001, 0, 0, 0)[..]);
        let resp = parse_one(&mut state, &mut buf, false, 0).unwrap().unwrap();
        assert!(!resp.is_error);
        assert_eq!(resp.hits, 0);
    }

    #[test]
    fn auth_error_sets_error_flag() {
        let mut state = MemcacheBinaryState::new();
        let mut buf = BytesMut::from(&response_header(STATUS_AUTH_ERROR, 0, 0, 0)[..]);
        let resp = parse_one(&mut state, &mut buf, false, 0).unwrap().unwrap();
        assert!(resp.is_error);
    }

    #[test]
    fn incomplete_header_waits() {
        let mut state = MemcacheBinaryState::new();
        let mut buf = BytesMut::from(&[MAGIC_RESPONSE, OPCODE_GET][..]);
        assert!(parse_one(&mut state, &mut buf, false, 0).unwrap().is_none());
    }

    #[test]
    fn encode_set_header_has_expected_extlen() {
        let mut out = BytesMut::new();
        encode_set(&mut out, b"k", b"v", 0);
        assert_eq!(out[4], 8);
        assert_eq!(&out[..2], &[MAGIC_REQUEST, OPCODE_SET]);
    }
}
