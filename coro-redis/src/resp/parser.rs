//! Incremental RESP2/RESP3 parser: feed it bytes as they arrive over the
//! wire via [`Parser::append`], drain complete values with
//! [`Parser::parse_all`]. Nesting is tracked with an explicit stack instead
//! of recursive calls, so a pathologically deep structure can't blow the
//! host call stack, and declared aggregate sizes never drive an eager
//! allocation — `*4294967295\r\n` reserves a few dozen slots, not four
//! billion.

use bytes::{Buf, Bytes, BytesMut};

use coro_core::error::CoreError;

use super::value::RedisValue;

const MAX_EAGER_RESERVE: usize = 128;
const MAX_INLINE_LEN: usize = 64 * 1024;

enum AggKind {
    Array,
    Set,
    Push,
}

enum Frame {
    Agg {
        kind: AggKind,
        remaining: i64,
        items: Vec<RedisValue>,
    },
    Map {
        is_attribute: bool,
        remaining_pairs: i64,
        items: Vec<(RedisValue, RedisValue)>,
        pending_key: Option<RedisValue>,
    },
}

enum Parsed {
    Leaf(RedisValue),
    PushFrame(Frame),
}

pub struct Parser {
    buf: BytesMut,
    stack: Vec<Frame>,
    pending_attrs: Vec<Vec<(RedisValue, RedisValue)>>,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            stack: Vec::new(),
            pending_attrs: Vec::new(),
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Drains every complete top-level value currently buffered, in
    /// arrival order. Leaves partial trailing data buffered for the next
    /// `append`.
    pub fn parse_all(&mut self) -> Result<Vec<RedisValue>, CoreError> {
        let mut out = Vec::new();
        while let Some(v) = self.try_parse_one()? {
            out.push(v);
        }
        Ok(out)
    }

    fn try_parse_one(&mut self) -> Result<Option<RedisValue>, CoreError> {
        loop {
            let parsed = match self.read_next_token()? {
                Some(p) => p,
                None => return Ok(None),
            };
            let mut value = match parsed {
                Parsed::PushFrame(Frame::Agg { kind, remaining: 0, items }) => match kind {
                    AggKind::Array => RedisValue::Array(items),
                    AggKind::Set => RedisValue::Set(items),
                    AggKind::Push => RedisValue::Push(items),
                },
                Parsed::PushFrame(Frame::Map { remaining_pairs: 0, is_attribute: false, items, .. }) => {
                    RedisValue::Map(items)
                }
                Parsed::PushFrame(Frame::Map { remaining_pairs: 0, is_attribute: true, items, .. }) => {
                    // An empty attribute map still needs its target value,
                    // which the next loop iteration will parse and wrap.
                    self.pending_attrs.push(items);
                    continue;
                }
                Parsed::PushFrame(frame) => {
                    self.stack.push(frame);
                    continue;
                }
                Parsed::Leaf(v) => v,
            };
            value = self.apply_pending_attrs(value);
            if let Some(done) = self.feed_value_up(value)? {
                return Ok(Some(done));
            }
        }
    }

    fn apply_pending_attrs(&mut self, value: RedisValue) -> RedisValue {
        match self.pending_attrs.pop() {
            Some(attrs) => RedisValue::Attribute {
                attrs,
                value: Box::new(value),
            },
            None => value,
        }
    }

    /// Having just completed `value`, feed it into the parent frame (if
    /// any). Returns `Some(value)` once there's no parent left to feed —
    /// i.e. a full top-level value is ready.
    fn feed_value_up(&mut self, mut value: RedisValue) -> Result<Option<RedisValue>, CoreError> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(Some(value));
            };
            match frame {
                Frame::Agg { remaining, items, .. } => {
                    items.push(value);
                    *remaining -= 1;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                }
                Frame::Map { remaining_pairs, items, pending_key, .. } => {
                    match pending_key.take() {
                        None => {
                            *pending_key = Some(value);
                            return Ok(None);
                        }
                        Some(key) => {
                            items.push((key, value));
                            *remaining_pairs -= 1;
                            if *remaining_pairs > 0 {
                                return Ok(None);
                            }
                        }
                    }
                }
            }
            let done = self.stack.pop().unwrap();
            match done {
                Frame::Agg { kind, items, .. } => {
                    value = match kind {
                        AggKind::Array => RedisValue::Array(items),
                        AggKind::Set => RedisValue::Set(items),
                        AggKind::Push => RedisValue::Push(items),
                    };
                }
                Frame::Map { is_attribute: false, items, .. } => {
                    value = RedisValue::Map(items);
                }
                Frame::Map { is_attribute: true, items, .. } => {
                    self.pending_attrs.push(items);
                    return Ok(None);
                }
            }
            value = self.apply_pending_attrs(value);
        }
    }

    fn read_line(&mut self) -> Option<Bytes> {
        let pos = self.buf.windows(2).position(|w| w == b"\r\n")?;
        let mut line = self.buf.split_to(pos);
        self.buf.advance(2);
        Some(line.split_to(line.len()).freeze())
    }

    fn read_exact(&mut self, n: usize) -> Option<Bytes> {
        if self.buf.len() < n + 2 {
            return None;
        }
        let payload = self.buf.split_to(n).freeze();
        self.buf.advance(2);
        Some(payload)
    }

    fn read_next_token(&mut self) -> Result<Option<Parsed>, CoreError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let tag = self.buf[0];
        if !is_type_byte(tag) {
            return self.read_inline_command();
        }
        // Peek for the header line without consuming until we know we have
        // the whole thing we need (bulk reads need the header plus body).
        let header_end = match self.buf.windows(2).position(|w| w == b"\r\n") {
            Some(p) => p,
            None => return Ok(None),
        };
        match tag {
            b'+' => {
                let line = self.read_line().unwrap();
                Ok(Some(Parsed::Leaf(RedisValue::SimpleString(utf8(&line[1..])?))))
            }
            b'-' => {
                let line = self.read_line().unwrap();
                Ok(Some(Parsed::Leaf(RedisValue::SimpleError(utf8(&line[1..])?))))
            }
            b':' => {
                let line = self.read_line().unwrap();
                let n = parse_i64(&line[1..])?;
                Ok(Some(Parsed::Leaf(RedisValue::Integer(n))))
            }
            b',' => {
                let line = self.read_line().unwrap();
                let s = utf8(&line[1..])?;
                let d: f64 = s.parse().map_err(|_| CoreError::invalid_input("malformed double"))?;
                Ok(Some(Parsed::Leaf(RedisValue::Double(d))))
            }
            b'#' => {
                let line = self.read_line().unwrap();
                match &line[1..] {
                    b"t" => Ok(Some(Parsed::Leaf(RedisValue::Boolean(true)))),
                    b"f" => Ok(Some(Parsed::Leaf(RedisValue::Boolean(false)))),
                    _ => Err(CoreError::invalid_input("malformed boolean")),
                }
            }
            b'_' => {
                self.read_line().unwrap();
                Ok(Some(Parsed::Leaf(RedisValue::Null)))
            }
            b'(' => {
                let line = self.read_line().unwrap();
                Ok(Some(Parsed::Leaf(RedisValue::BigNumber(utf8(&line[1..])?))))
            }
            b'$' | b'!' | b'=' => {
                let line_peek = &self.buf[1..header_end];
                let declared = parse_i64(line_peek)?;
                if declared < 0 {
                    self.read_line().unwrap();
                    return Ok(Some(Parsed::Leaf(RedisValue::Null)));
                }
                let declared = declared as usize;
                if declared > isize::MAX as usize / 2 {
                    return Err(CoreError::invalid_input("declared bulk length absurdly large"));
                }
                self.read_line().unwrap(); // drop the header now that we've peeked it
                let Some(payload) = self.read_exact(declared) else {
                    return Ok(None);
                };
                Ok(Some(Parsed::Leaf(match tag {
                    b'$' => RedisValue::BulkString(payload),
                    b'!' => RedisValue::BulkError(payload),
                    b'=' => {
                        let text = utf8(&payload)?;
                        let (format, rest) = text.split_at(text.len().min(3));
                        RedisValue::VerbatimString {
                            format: format.trim_end_matches(':').to_string(),
                            text: rest.trim_start_matches(':').to_string(),
                        }
                    }
                    _ => unreachable!(),
                })))
            }
            b'*' | b'~' | b'>' => {
                let line_peek = &self.buf[1..header_end];
                let declared = parse_i64(line_peek)?;
                self.read_line().unwrap();
                if declared < 0 {
                    return Ok(Some(Parsed::Leaf(RedisValue::Null)));
                }
                let reserve = (declared as usize).min(MAX_EAGER_RESERVE);
                let kind = match tag {
                    b'*' => AggKind::Array,
                    b'~' => AggKind::Set,
                    b'>' => AggKind::Push,
                    _ => unreachable!(),
                };
                Ok(Some(Parsed::PushFrame(Frame::Agg {
                    kind,
                    remaining: declared,
                    items: Vec::with_capacity(reserve),
                })))
            }
            b'%' | b'|' => {
                let line_peek = &self.buf[1..header_end];
                let declared = parse_i64(line_peek)?;
                self.read_line().unwrap();
                if declared < 0 {
                    return Ok(Some(Parsed::Leaf(RedisValue::Null)));
                }
                let reserve = (declared as usize).min(MAX_EAGER_RESERVE);
                Ok(Some(Parsed::PushFrame(Frame::Map {
                    is_attribute: tag == b'|',
                    remaining_pairs: declared,
                    items: Vec::with_capacity(reserve),
                    pending_key: None,
                })))
            }
            _ => Err(CoreError::invalid_input(format!("unknown RESP type byte: {tag:#x}"))),
        }
    }

    /// Legacy inline commands: a bare line of whitespace-separated tokens,
    /// parsed as an array of bulk strings.
    fn read_inline_command(&mut self) -> Result<Option<Parsed>, CoreError> {
        let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") else {
            if self.buf.len() > MAX_INLINE_LEN {
                return Err(CoreError::invalid_input("inline command exceeds maximum length"));
            }
            return Ok(None);
        };
        let mut line = self.buf.split_to(pos);
        self.buf.advance(2);
        let line = line.split_to(line.len()).freeze();
        let text = utf8(&line)?;
        let items = text
            .split_whitespace()
            .map(|tok| RedisValue::BulkString(Bytes::copy_from_slice(tok.as_bytes())))
            .collect();
        Ok(Some(Parsed::Leaf(RedisValue::Array(items))))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_type_byte(b: u8) -> bool {
    matches!(b, b'+' | b'-' | b':' | b'$' | b'*' | b'_' | b'#' | b',' | b'(' | b'!' | b'=' | b'%' | b'~' | b'>' | b'|')
}

fn utf8(bytes: &[u8]) -> Result<String, CoreError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| CoreError::invalid_input("invalid utf-8 in RESP frame"))
}

fn parse_i64(bytes: &[u8]) -> Result<i64, CoreError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CoreError::invalid_input("malformed integer in RESP frame"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Vec<RedisValue> {
        let mut parser = Parser::new();
        parser.append(input);
        parser.parse_all().unwrap()
    }

    #[test]
    fn parses_simple_string() {
        let v = parse(b"+OK\r\n");
        assert_eq!(v, vec![RedisValue::SimpleString("OK".into())]);
    }

    #[test]
    fn parses_nested_array() {
        let v = parse(b"*2\r\n:1\r\n*1\r\n+a\r\n");
        assert_eq!(
            v,
            vec![RedisValue::Array(vec![
                RedisValue::Integer(1),
                RedisValue::Array(vec![RedisValue::SimpleString("a".into())]),
            ])]
        );
    }

    #[test]
    fn parses_null_bulk_and_array() {
        assert_eq!(parse(b"$-1\r\n"), vec![RedisValue::Null]);
        assert_eq!(parse(b"*-1\r\n"), vec![RedisValue::Null]);
        assert_eq!(parse(b"_\r\n"), vec![RedisValue::Null]);
    }

    #[test]
    fn parses_map_and_boolean_and_double() {
        let v = parse(b"%1\r\n+flag\r\n#t\r\n");
        assert_eq!(
            v,
            vec![RedisValue::Map(vec![(RedisValue::SimpleString("flag".into()), RedisValue::Boolean(true))])]
        );
        assert_eq!(parse(b",3.14\r\n"), vec![RedisValue::Double(3.14)]);
    }

    #[test]
    fn parses_attribute_wrapping_the_following_reply() {
        let v = parse(b"|1\r\n+ttl\r\n:10\r\n$5\r\nhello\r\n");
        match &v[0] {
            RedisValue::Attribute { attrs, value } => {
                assert_eq!(attrs.len(), 1);
                assert_eq!(value.as_bulk_str(), Some("hello"));
            }
            other => panic!("expected attribute, got {other:?}"),
        }
    }

    #[test]
    fn deeply_nested_arrays_parse_without_overflowing_the_host_stack() {
        let depth = 50_000;
        let mut buf = Vec::new();
        for _ in 0..depth {
            buf.extend_from_slice(b"*1\r\n");
        }
        buf.extend_from_slice(b":1\r\n");
        let v = parse(&buf);
        assert_eq!(v.len(), 1);
        let mut cur = &v[0];
        let mut levels = 0;
        while let RedisValue::Array(items) = cur {
            cur = &items[0];
            levels += 1;
        }
        assert_eq!(levels, depth);
    }

    #[test]
    fn incremental_feed_across_multiple_appends() {
        let mut parser = Parser::new();
        parser.append(b"+OK");
        assert!(parser.parse_all().unwrap().is_empty());
        parser.append(b"\r\n");
        assert_eq!(parser.parse_all().unwrap(), vec![RedisValue::SimpleString("OK".into())]);
    }

    #[test]
    fn inline_command_parses_as_bulk_string_array() {
        let v = parse(b"PING hello\r\n");
        assert_eq!(
            v,
            vec![RedisValue::Array(vec![
                RedisValue::BulkString(Bytes::from_static(b"PING")),
                RedisValue::BulkString(Bytes::from_static(b"hello")),
            ])]
        );
    }

    #[test]
    fn huge_declared_array_size_does_not_eagerly_allocate() {
        let mut parser = Parser::new();
        parser.append(b"*4294967295\r\n");
        // Nothing should have blown up yet: the declared count is pending,
        // waiting for elements to actually arrive.
        assert!(parser.parse_all().unwrap().is_empty());
    }
}
