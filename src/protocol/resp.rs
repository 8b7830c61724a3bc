//! RESP2/RESP3 codec, grounded on `protocol.cpp`'s `redis_protocol`.
//!
//! The parser is a direct port of `parse_response()`'s four-state
//! machine (`rs_initial` / `rs_read_line` / `rs_read_bulk` /
//! `rs_end_bulk`), adapted from libevent's `evbuffer` to an in-memory
//! `BytesMut` that the connection's read loop appends to. `response_ended()`
//! and the aggregate/blob/single type classifiers are carried over
//! unchanged in meaning.

use bytes::{Buf, BufMut, BytesMut};

use super::{CompiledCommand, ArgKind, ParsedResponse};
use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RState {
    Initial,
    ReadLine,
    ReadBulk,
    EndBulk,
}

/// One node of the mbulk tree built when `keep_value` is set (verification
/// runs and `CLUSTER SLOTS` parsing, which needs the nested array shape).
#[derive(Debug, Clone)]
pub enum RespValue {
    Bulk(Option<Vec<u8>>),
    Status(String),
    Mbulk(Vec<RespValue>),
}

struct MbulkFrame {
    remaining: i64,
    items: Vec<RespValue>,
}

pub struct RespState {
    state: RState,
    bulk_len: i64,
    response_len: usize,
    total_bulks_count: i64,
    attribute: bool,
    status: String,
    is_error: bool,
    hits: u32,
    stack: Vec<MbulkFrame>,
    root: Option<RespValue>,
}

impl RespState {
    pub fn new() -> Self {
        Self {
            state: RState::Initial,
            bulk_len: 0,
            response_len: 0,
            total_bulks_count: 0,
            attribute: false,
            status: String::new(),
            is_error: false,
            hits: 0,
            stack: Vec::new(),
            root: None,
        }
    }

    fn reset(&mut self) {
        self.response_len = 0;
        self.total_bulks_count = 0;
        self.attribute = false;
        self.status.clear();
        self.is_error = false;
        self.hits = 0;
        self.stack.clear();
        self.root = None;
    }

    fn response_ended(&mut self) -> bool {
        if self.total_bulks_count != 0 {
            return false;
        }
        if self.attribute {
            self.attribute = false;
            return false;
        }
        true
    }

    fn push_value(&mut self, value: RespValue, keep_value: bool) {
        if !keep_value {
            return;
        }
        if let Some(frame) = self.stack.last_mut() {
            frame.remaining -= 1;
            frame.items.push(value);
            while self.stack.last().map(|f| f.remaining == 0).unwrap_or(false) {
                let finished = self.stack.pop().unwrap();
                let completed = RespValue::Mbulk(finished.items);
                match self.stack.last_mut() {
                    Some(parent) => {
                        parent.remaining -= 1;
                        parent.items.push(completed);
                    }
                    None => self.root = Some(completed),
                }
            }
        } else {
            self.root = Some(value);
        }
    }
}

fn aggregate_type(c: u8, resp3: bool) -> bool {
    c == b'*' || (resp3 && matches!(c, b'%' | b'~' | b'|'))
}

fn blob_type(c: u8, resp3: bool) -> bool {
    c == b'$' || (resp3 && matches!(c, b'!' | b'='))
}

fn single_type(c: u8, resp3: bool) -> bool {
    matches!(c, b'+' | b'-' | b':') || (resp3 && matches!(c, b'_' | b',' | b'#' | b'('))
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

fn parse_count(line: &[u8]) -> i64 {
    std::str::from_utf8(&line[1..])
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(0)
}

pub fn parse_one(
    state: &mut RespState,
    buf: &mut BytesMut,
    resp3: bool,
    keep_value: bool,
    conn_id: usize,
) -> Result<Option<ParsedResponse>, EngineError> {
    loop {
        match state.state {
            RState::Initial => {
                state.reset();
                state.state = RState::ReadLine;
            }
            RState::ReadLine => {
                let Some(line) = read_line(buf) else { return Ok(None) };
                state.response_len += line.len() + 2;
                if line.is_empty() {
                    return Err(EngineError::Parse {
                        conn_id,
                        state: "resp_read_line",
                        consumed: state.response_len,
                        preview: String::new(),
                    });
                }
                let tag = line[0];

                if aggregate_type(tag, resp3) {
                    let mut count = parse_count(&line);
                    if state.total_bulks_count > 0 {
                        state.total_bulks_count -= 1;
                    }
                    if count < 0 {
                        count = 0;
                    }
                    if tag == b'|' {
                        state.attribute = true;
                    }
                    if tag == b'%' || tag == b'|' {
                        count *= 2;
                    }
                    if keep_value {
                        state.stack.push(MbulkFrame { remaining: count, items: Vec::new() });
                        if count == 0 {
                            // Zero-length aggregate completes immediately.
                            let frame = state.stack.pop().unwrap();
                            let completed = RespValue::Mbulk(frame.items);
                            match state.stack.last_mut() {
                                Some(parent) => {
                                    parent.remaining -= 1;
                                    parent.items.push(completed);
                                }
                                None => state.root = Some(completed),
                            }
                        }
                    }
                    state.status = String::from_utf8_lossy(&line).into_owned();
                    state.total_bulks_count += count;

                    if state.response_ended() {
                        let resp = finalize(state);
                        state.state = RState::Initial;
                        return Ok(Some(resp));
                    }
                } else if blob_type(tag, resp3) {
                    if state.total_bulks_count == 0 {
                        state.total_bulks_count += 1;
                    }
                    state.bulk_len = parse_count(&line);
                    state.status = String::from_utf8_lossy(&line).into_owned();
                    if tag == b'!' {
                        state.is_error = true;
                    }
                    state.state = if state.bulk_len < 0 { RState::EndBulk } else { RState::ReadBulk };
                } else if single_type(tag, resp3) {
                    if state.total_bulks_count == 0 {
                        state.total_bulks_count += 1;
                    }
                    if keep_value && !state.stack.is_empty() {
                        state.push_value(RespValue::Status(String::from_utf8_lossy(&line).into_owned()), keep_value);
                    }
                    if tag == b'-' {
                        state.is_error = true;
                    }
                    state.status = String::from_utf8_lossy(&line).into_owned();
                    state.total_bulks_count -= 1;

                    if state.response_ended() {
                        let resp = finalize(state);
                        state.state = RState::Initial;
                        return Ok(Some(resp));
                    }
                } else {
                    return Err(EngineError::Parse {
                        conn_id,
                        state: "resp_read_line",
                        consumed: state.response_len,
                        preview: String::from_utf8_lossy(&line).into_owned(),
                    });
                }
            }
            RState::ReadBulk => {
                if (buf.len() as i64) >= state.bulk_len + 2 {
                    state.response_len += (state.bulk_len + 2) as usize;
                    if state.bulk_len > 0 {
                        state.hits += 1;
                    }
                    state.state = RState::EndBulk;
                } else {
                    return Ok(None);
                }
            }
            RState::EndBulk => {
                let value = if state.bulk_len > 0 {
                    let v = buf[..state.bulk_len as usize].to_vec();
                    buf.advance(state.bulk_len as usize);
                    buf.advance(2);
                    Some(v)
                } else {
                    if state.bulk_len == 0 {
                        buf.advance(2);
                    }
                    None
                };
                if keep_value {
                    state.push_value(RespValue::Bulk(value), true);
                } else if state.stack.is_empty() {
                    state.root = Some(RespValue::Bulk(value));
                }
                state.total_bulks_count -= 1;

                if state.response_ended() {
                    let resp = finalize(state);
                    state.state = RState::Initial;
                    return Ok(Some(resp));
                } else {
                    state.state = RState::ReadLine;
                }
            }
        }
    }
}

fn finalize(state: &mut RespState) -> ParsedResponse {
    let value = match &state.root {
        Some(RespValue::Bulk(Some(v))) => Some(v.clone()),
        _ => None,
    };
    ParsedResponse {
        status: state.status.clone(),
        is_error: state.is_error,
        hits: state.hits,
        total_len: state.response_len,
        value,
        tree: state.root.take(),
    }
}

fn write_bulk_string(out: &mut BytesMut, data: &[u8]) {
    out.put_slice(format!("${}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

pub fn encode_set(out: &mut BytesMut, key: &[u8], value: &[u8], expiry: u32) {
    if expiry == 0 {
        out.put_slice(b"*3\r\n$3\r\nSET\r\n");
        write_bulk_string(out, key);
        write_bulk_string(out, value);
    } else {
        out.put_slice(b"*4\r\n$5\r\nSETEX\r\n");
        write_bulk_string(out, key);
        write_bulk_string(out, expiry.to_string().as_bytes());
        write_bulk_string(out, value);
    }
}

pub fn encode_get(out: &mut BytesMut, key: &[u8]) {
    out.put_slice(b"*2\r\n$3\r\nGET\r\n");
    write_bulk_string(out, key);
}

pub fn encode_wait(out: &mut BytesMut, num_slaves: u32, timeout_ms: u32) {
    out.put_slice(b"*3\r\n$4\r\nWAIT\r\n");
    write_bulk_string(out, num_slaves.to_string().as_bytes());
    write_bulk_string(out, timeout_ms.to_string().as_bytes());
}

pub fn encode_auth(out: &mut BytesMut, credentials: &str) {
    let parts: Vec<&str> = credentials.splitn(2, ':').collect();
    if parts.len() == 2 {
        out.put_slice(b"*3\r\n$4\r\nAUTH\r\n");
        write_bulk_string(out, parts[0].as_bytes());
        write_bulk_string(out, parts[1].as_bytes());
    } else {
        out.put_slice(b"*2\r\n$4\r\nAUTH\r\n");
        write_bulk_string(out, credentials.as_bytes());
    }
}

pub fn encode_select(out: &mut BytesMut, db: u32) {
    out.put_slice(b"*2\r\n$6\r\nSELECT\r\n");
    write_bulk_string(out, db.to_string().as_bytes());
}

pub fn encode_hello(out: &mut BytesMut, version: u32) {
    out.put_slice(b"*2\r\n$5\r\nHELLO\r\n");
    write_bulk_string(out, version.to_string().as_bytes());
}

pub fn encode_cluster_slots(out: &mut BytesMut) {
    out.put_slice(b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nSLOTS\r\n");
}

pub fn encode_arbitrary(out: &mut BytesMut, cmd: &CompiledCommand, key: &[u8], data: &[u8]) {
    out.put_slice(format!("*{}\r\n", cmd.args.len() + 1).as_bytes());
    write_bulk_string(out, cmd.name.as_bytes());
    for arg in &cmd.args {
        match arg {
            ArgKind::Const(s) => write_bulk_string(out, s.as_bytes()),
            ArgKind::Key => write_bulk_string(out, key),
            ArgKind::Data => write_bulk_string(out, data),
            ArgKind::MonitorRandom(_) => write_bulk_string(out, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_buf(buf: &mut BytesMut, resp3: bool) -> Option<ParsedResponse> {
        let mut state = RespState::new();
        parse_one(&mut state, buf, resp3, false, 0).unwrap()
    }

    #[test]
    fn simple_string_parses() {
        let mut buf = BytesMut::from(&b"+OK\r\n"[..]);
        let resp = parse_buf(&mut buf, false).unwrap();
        assert_eq!(resp.status, "+OK");
        assert!(!resp.is_error);
    }

    #[test]
    fn error_reply_sets_error_flag() {
        let mut buf = BytesMut::from(&b"-ERR bad thing\r\n"[..]);
        let resp = parse_buf(&mut buf, false).unwrap();
        assert!(resp.is_error);
    }

    #[test]
    fn bulk_string_value_and_hit_counted() {
        let mut buf = BytesMut::from(&b"$5\r\nhello\r\n"[..]);
        let resp = parse_buf(&mut buf, false).unwrap();
        assert_eq!(resp.value.as_deref(), Some(&b"hello"[..]));
        assert_eq!(resp.hits, 1);
    }

    #[test]
    fn null_bulk_is_not_a_hit() {
        let mut buf = BytesMut::from(&b"$-1\r\n"[..]);
        let resp = parse_buf(&mut buf, false).unwrap();
        assert!(resp.value.is_none());
        assert_eq!(resp.hits, 0);
    }

    #[test]
    fn incomplete_buffer_returns_none_and_does_not_consume() {
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        let mut state = RespState::new();
        let result = parse_one(&mut state, &mut buf, false, false, 0).unwrap();
        assert!(result.is_none());
        assert_eq!(&buf[..], b"hel");
    }

    #[test]
    fn split_across_two_feeds_completes_on_second() {
        let mut state = RespState::new();
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert!(parse_one(&mut state, &mut buf, false, false, 0).unwrap().is_none());
        buf.extend_from_slice(b"lo\r\n");
        let resp = parse_one(&mut state, &mut buf, false, false, 0).unwrap().unwrap();
        assert_eq!(resp.value.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn nested_array_counts_all_elements_before_completing() {
        let wire = b"*2\r\n$3\r\nfoo\r\n*1\r\n$3\r\nbar\r\n";
        let mut buf = BytesMut::from(&wire[..]);
        let mut state = RespState::new();
        let resp = parse_one(&mut state, &mut buf, false, true, 0).unwrap().unwrap();
        assert_eq!(resp.total_len, wire.len());
        assert!(buf.is_empty());
    }

    #[test]
    fn resp3_map_header_doubles_field_count() {
        let mut buf = BytesMut::from(&b"%1\r\n$1\r\na\r\n$1\r\nb\r\n"[..]);
        let resp = parse_buf(&mut buf, true).unwrap();
        assert!(buf.is_empty());
        assert!(!resp.is_error);
    }

    #[test]
    fn encode_set_without_expiry_uses_set_command() {
        let mut out = BytesMut::new();
        encode_set(&mut out, b"k", b"v", 0);
        assert_eq!(&out[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn encode_set_with_expiry_uses_setex() {
        let mut out = BytesMut::new();
        encode_set(&mut out, b"k", b"v", 60);
        assert_eq!(&out[..], b"*4\r\n$5\r\nSETEX\r\n$1\r\nk\r\n$2\r\n60\r\n$1\r\nv\r\n");
    }

    #[test]
    fn encode_get_matches_wire_format() {
        let mut out = BytesMut::new();
        encode_get(&mut out, b"k");
        assert_eq!(&out[..], b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    }

    #[test]
    fn substring_placeholder_is_rejected() {
        use super::super::classify_arg;
        assert!(classify_arg("prefix__key__").is_err());
    }

    #[test]
    fn exact_placeholder_is_accepted() {
        use super::super::{classify_arg, ArgKind};
        assert_eq!(classify_arg("__key__").unwrap(), ArgKind::Key);
    }
}
