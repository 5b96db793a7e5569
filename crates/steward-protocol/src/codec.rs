//! Payload codecs.
//!
//! Every payload on the wire is a dynamic [`Value`] encoded with one of the
//! [`Codec`]s, optionally zlib-compressed. Client and server must agree on both
//! settings; nothing in the frame says which were used.

use std::convert::Infallible;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// Nesting limit when decoding CBOR.
const MAX_DEPTH: usize = 128;

/// Malformed payload bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cbor: {0}")]
    Cbor(#[from] minicbor::decode::Error),

    #[error("zlib: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("decompressed payload exceeds {max} bytes")]
    Inflated { max: u32 },

    #[error("indefinite-length CBOR not supported")]
    IndefiniteLength,

    #[error("unsupported CBOR item: {0}")]
    Unsupported(String),

    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Serialization format for payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Portable structured text.
    #[default]
    Json,
    /// Compact binary.
    Cbor,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(format!("unknown codec '{other}' (expected json or cbor)")),
        }
    }
}

/// A codec plus the compression switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Serializer {
    pub codec: Codec,
    pub compress: bool,
}

impl Serializer {
    pub fn new(codec: Codec, compress: bool) -> Self {
        Self { codec, compress }
    }

    pub fn json() -> Self {
        Self::new(Codec::Json, false)
    }

    pub fn cbor() -> Self {
        Self::new(Codec::Cbor, false)
    }

    #[must_use]
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    /// Encodes a value, compressing afterwards if enabled.
    pub fn serialize(&self, value: &Value) -> ProtocolResult<Vec<u8>> {
        let raw = match self.codec {
            Codec::Json => serde_json::to_vec(value).map_err(ProtocolError::serialization)?,
            Codec::Cbor => cbor_encode(value).map_err(ProtocolError::serialization)?,
        };
        if !self.compress {
            return Ok(raw);
        }
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    /// Reverses [`serialize`](Self::serialize).
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Value, DecodeError> {
        if self.compress {
            let limit = u64::from(MAX_MESSAGE_SIZE);
            let mut raw = Vec::with_capacity(bytes.len() * 2);
            ZlibDecoder::new(bytes)
                .take(limit + 1)
                .read_to_end(&mut raw)
                .map_err(DecodeError::Decompress)?;
            if raw.len() as u64 > limit {
                return Err(DecodeError::Inflated {
                    max: MAX_MESSAGE_SIZE,
                });
            }
            self.decode_raw(&raw)
        } else {
            self.decode_raw(bytes)
        }
    }

    fn decode_raw(&self, bytes: &[u8]) -> Result<Value, DecodeError> {
        match self.codec {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Cbor => cbor_decode(bytes),
        }
    }

    /// Serializes any serde type by way of [`Value`].
    pub fn encode<T: Serialize>(&self, message: &T) -> ProtocolResult<Vec<u8>> {
        let value = serde_json::to_value(message).map_err(ProtocolError::serialization)?;
        self.serialize(&value)
    }

    /// Deserializes bytes into a typed message.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> ProtocolResult<T> {
        let value = self.deserialize(bytes)?;
        serde_json::from_value(value).map_err(|e| ProtocolError::invalid(e.to_string()))
    }
}

fn cbor_encode(value: &Value) -> Result<Vec<u8>, minicbor::encode::Error<Infallible>> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_value(&mut enc, value)?;
    Ok(buf)
}

fn encode_value<W>(enc: &mut Encoder<W>, value: &Value) -> Result<(), minicbor::encode::Error<W::Error>>
where
    W: minicbor::encode::Write,
{
    match value {
        Value::Null => {
            enc.null()?;
        }
        Value::Bool(b) => {
            enc.bool(*b)?;
        }
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                enc.u64(u)?;
            } else if let Some(i) = n.as_i64() {
                enc.i64(i)?;
            } else if let Some(f) = n.as_f64() {
                enc.f64(f)?;
            }
        }
        Value::String(s) => {
            enc.str(s)?;
        }
        Value::Array(items) => {
            enc.array(items.len() as u64)?;
            for item in items {
                encode_value(enc, item)?;
            }
        }
        Value::Object(map) => {
            enc.map(map.len() as u64)?;
            for (key, item) in map {
                enc.str(key)?;
                encode_value(enc, item)?;
            }
        }
    }
    Ok(())
}

fn cbor_decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let value = decode_value(&mut dec, 0)?;
    let rest = bytes.len() - dec.position();
    if rest != 0 {
        return Err(DecodeError::TrailingBytes(rest));
    }
    Ok(value)
}

fn decode_value(dec: &mut Decoder<'_>, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    let ty = dec.datatype()?;
    let value = match ty {
        Type::Null | Type::Undefined => {
            dec.skip()?;
            Value::Null
        }
        Type::Bool => Value::Bool(dec.bool()?),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Value::from(dec.u64()?),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => Value::from(dec.i64()?),
        Type::Int => {
            let int = dec.int()?;
            match i64::try_from(int) {
                Ok(i) => Value::from(i),
                Err(_) => u64::try_from(int)
                    .map(Value::from)
                    .map_err(|_| DecodeError::Unsupported("integer out of range".into()))?,
            }
        }
        Type::F16 | Type::F32 | Type::F64 => {
            let f = dec.f64()?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| DecodeError::Unsupported(format!("non-finite float {f}")))?
        }
        Type::String => Value::String(dec.str()?.to_string()),
        Type::Bytes => Value::Array(dec.bytes()?.iter().map(|b| Value::from(*b)).collect()),
        Type::Array => {
            let len = dec.array()?.ok_or(DecodeError::IndefiniteLength)?;
            let mut items = Vec::new();
            for _ in 0..len {
                items.push(decode_value(dec, depth + 1)?);
            }
            Value::Array(items)
        }
        Type::Map => {
            let len = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
            let mut map = Map::new();
            for _ in 0..len {
                let key = match dec.datatype()? {
                    Type::String => dec.str()?.to_string(),
                    other => return Err(DecodeError::Unsupported(format!("{other} map key"))),
                };
                map.insert(key, decode_value(dec, depth + 1)?);
            }
            Value::Object(map)
        }
        Type::Tag => {
            dec.tag()?;
            decode_value(dec, depth + 1)?
        }
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef => {
            return Err(DecodeError::IndefiniteLength);
        }
        other => return Err(DecodeError::Unsupported(other.to_string())),
    };
    Ok(value)
}
