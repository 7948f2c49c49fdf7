//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the serialization format shared by DHT messages (KRPC) and HTTP
//! tracker responses.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! # Examples
//!
//! ```
//! use swarmseed::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d3:foo3:bare").unwrap().unwrap();
//! assert_eq!(value.get(b"foo").and_then(|v| v.as_str()), Some("bar"));
//! assert_eq!(encode(&value), b"d3:foo3:bare");
//!
//! // Empty input is "no value", not an error.
//! assert_eq!(decode(b"").unwrap(), None);
//! ```
//!
//! Dictionaries are stored in a [`BTreeMap`](std::collections::BTreeMap), so
//! re-encoding the same logical map always produces the same bytes.
//!
//! # Errors
//!
//! Every [`BencodeError`] carries the byte offset at which decoding failed.
//! The decoder is used on untrusted network input and never panics.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::{DictBuilder, Value};
