use super::error::BencodeError;
use super::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

const MAX_DEPTH: usize = 64;

/// Decodes a single bencoded value.
///
/// Returns `Ok(None)` for an empty buffer. Any bytes left over after the
/// first complete value are an error.
pub fn decode(data: &[u8]) -> Result<Option<Value>, BencodeError> {
    if data.is_empty() {
        return Ok(None);
    }

    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;

    if decoder.pos != data.len() {
        return Err(BencodeError::TrailingData { offset: decoder.pos });
    }

    Ok(Some(value))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof { offset: self.pos })
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep { offset: self.pos });
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedChar {
                offset: self.pos,
                found: c as char,
            }),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;

        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|i| start + i)
            .ok_or(BencodeError::UnexpectedEof {
                offset: self.data.len(),
            })?;

        let digits = &self.data[start..end];
        let invalid = |reason: &str| BencodeError::InvalidInteger {
            offset: start,
            reason: reason.to_string(),
        };

        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() {
            return Err(invalid("empty"));
        }
        if !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(invalid("non-digit"));
        }
        if digits == b"-0" {
            return Err(invalid("negative zero"));
        }
        if unsigned[0] == b'0' && unsigned.len() > 1 {
            return Err(invalid("leading zeros"));
        }

        // Only ASCII digits and an optional sign remain, so this is valid UTF-8.
        let text = std::str::from_utf8(digits).map_err(|_| invalid("non-digit"))?;
        let value: i64 = text.parse().map_err(|_| invalid("out of range"))?;

        self.pos = end + 1;
        Ok(Value::Integer(value))
    }

    fn bytes(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;

        let colon = self.data[start..]
            .iter()
            .position(|&b| b == b':')
            .map(|i| start + i)
            .ok_or(BencodeError::UnexpectedEof {
                offset: self.data.len(),
            })?;

        let digits = &self.data[start..colon];
        let bad_length = BencodeError::InvalidStringLength { offset: start };

        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(bad_length);
        }
        if digits[0] == b'0' && digits.len() > 1 {
            return Err(bad_length);
        }

        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(bad_length)?;

        let body = colon + 1;
        let end = body
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof {
                offset: self.data.len(),
            })?;

        self.pos = end;
        Ok(Bytes::copy_from_slice(&self.data[body..end]))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut list = Vec::new();

        while self.peek()? != b'e' {
            list.push(self.value(depth + 1)?);
        }

        self.pos += 1;
        Ok(Value::List(list))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = BTreeMap::new();

        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey { offset: self.pos });
            }
            let key = self.bytes()?;
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }

        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}
