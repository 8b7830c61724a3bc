//! Memcache text protocol, grounded on `protocol.cpp`'s
//! `memcache_text_protocol`.

use bytes::{Buf, BufMut, BytesMut};

use super::ParsedResponse;
use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MState {
    Initial,
    ReadSection,
    ReadValue,
    ReadEnd,
}

pub struct MemcacheTextState {
    state: MState,
    value_len: usize,
    response_len: usize,
    status: String,
    is_error: bool,
    hits: u32,
}

impl MemcacheTextState {
    pub fn new() -> Self {
        Self {
            state: MState::Initial,
            value_len: 0,
            response_len: 0,
            status: String::new(),
            is_error: false,
            hits: 0,
        }
    }
}

fn read_line(buf: &mut BytesMut) -> Option<Vec<u8>> {
    let pos = memchr::memchr(b'\r', &buf[..])?;
    if buf.len() <= pos + 1 || buf[pos + 1] != b'\n' {
        return None;
    }
    let line = buf[..pos].to_vec();
    buf.advance(pos + 2);
    Some(line)
}

pub fn parse_one(
    state: &mut MemcacheTextState,
    buf: &mut BytesMut,
    keep_value: bool,
    conn_id: usize,
) -> Result<Option<ParsedResponse>, EngineError> {
    loop {
        match state.state {
            MState::Initial => {
                state.response_len = 0;
                state.status.clear();
                state.is_error = false;
                state.hits = 0;
                state.state = MState::ReadSection;
            }
            MState::ReadSection => {
                let Some(line) = read_line(buf) else { return Ok(None) };
                state.response_len += line.len() + 2;
                if state.status.is_empty() {
                    state.status = String::from_utf8_lossy(&line).into_owned();
                }

                if line.starts_with(b"VALUE") {
                    let fields: Vec<&[u8]> = line.split(|b| *b == b' ').collect();
                    if fields.len() < 4 {
                        return Err(EngineError::Parse {
                            conn_id,
                            state: "memcache_read_section",
                            consumed: state.response_len,
                            preview: String::from_utf8_lossy(&line).into_owned(),
                        });
                    }
                    let len_str = std::str::from_utf8(fields[3]).unwrap_or("0");
                    state.value_len = len_str.trim().parse().unwrap_or(0);
                    state.state = MState::ReadValue;
                } else if line.starts_with(b"END") || line.starts_with(b"STORED") {
                    state.state = MState::ReadEnd;
                } else {
                    state.is_error = true;
                    return Err(EngineError::Parse {
                        conn_id,
                        state: "memcache_read_section",
                        consumed: state.response_len,
                        preview: String::from_utf8_lossy(&line).into_owned(),
                    });
                }
            }
            MState::ReadValue => {
                if buf.len() >= state.value_len + 2 {
                    let _value = if keep_value {
                        Some(buf[..state.value_len].to_vec())
                    } else {
                        None
                    };
                    buf.advance(state.value_len);
                    buf.advance(2);
                    state.hits += 1;
                    state.response_len += state.value_len + 2;
                    state.state = MState::ReadSection;
                } else {
                    return Ok(None);
                }
            }
            MState::ReadEnd => {
                state.state = MState::Initial;
                return Ok(Some(ParsedResponse {
                    status: state.status.clone(),
                    is_error: state.is_error,
                    hits: state.hits,
                    total_len: state.response_len,
                    value: None,
                    tree: None,
                }));
            }
        }
    }
}

pub fn encode_set(out: &mut BytesMut, key: &[u8], value: &[u8], expiry: u32) {
    out.put_slice(b"set ");
    out.put_slice(key);
    out.put_slice(format!(" 0 {} {}\r\n", expiry, value.len()).as_bytes());
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

pub fn encode_get(out: &mut BytesMut, key: &[u8]) {
    out.put_slice(b"get ");
    out.put_slice(key);
    out.put_slice(b"\r\n");
}

pub fn encode_multi_get(out: &mut BytesMut, keys: &[Vec<u8>]) {
    out.put_slice(b"get");
    for key in keys {
        out.put_slice(b" ");
        out.put_slice(key);
    }
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_reply_completes_without_value() {
        let mut state = MemcacheTextState::new();
        let mut buf = BytesMut::from(&b"STORED\r\n"[..]);
        let resp = parse_one(&mut state, &mut buf, false, 0).unwrap().unwrap();
        assert_eq!(resp.status, "STORED");
        assert!(!resp.is_error);
    }

    #[test]
    fn value_then_end_counts_one_hit() {
        let mut state = MemcacheTextState::new();
        let mut buf = BytesMut::from(&b"VALUE key 0 5\r\nhello\r\nEND\r\n"[..]);
        let resp = parse_one(&mut state, &mut buf, false, 0).unwrap().unwrap();
        assert_eq!(resp.hits, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_value_waits_for_more_data() {
        let mut state = MemcacheTextState::new();
        let mut buf = BytesMut::from(&b"VALUE key 0 5\r\nhel"[..]);
        let result = parse_one(&mut state, &mut buf, false, 0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn multi_get_joins_keys_with_spaces() {
        let mut out = BytesMut::new();
        encode_multi_get(&mut out, &[b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(&out[..], b"get a b\r\n");
    }
}
