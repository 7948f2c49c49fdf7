use super::value::Value;

/// Encodes a bencode value.
///
/// Dictionary keys are written in sorted order, so equal values always
/// encode to identical bytes.
///
/// # Examples
///
/// ```
/// use swarmseed::bencode::{encode, Value};
///
/// assert_eq!(encode(&Value::Integer(0)), b"i0e");
/// assert_eq!(encode(&Value::string("spam")), b"4:spam");
/// assert_eq!(
///     encode(&Value::List(vec![Value::Integer(1), Value::string("two")])),
///     b"li1e3:twoe"
/// );
/// ```
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(value, &mut buf);
    buf
}

fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::List(l) => {
            buf.push(b'l');
            for item in l {
                encode_value(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(d) => {
            buf.push(b'd');
            for (key, val) in d {
                encode_bytes(key, buf);
                encode_value(val, buf);
            }
            buf.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}
