//! # Protocol Frames
//!
//! Defines the RPC envelopes (Request vs Response) and their byte layout.
//!
//! ## Layout
//!
//! ```text
//! [version: 1b = 0x01] [Variant "Request" | "Response"] -> Map {
//!     Request:  id, service, method, params
//!     Response: id, answer, error_spot
//! }
//! ```
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Exactness**: A frame must be consumed completely; trailing bytes are a violation.
//! - **Forward Tolerance**: Unknown map keys are skipped.

use wirepack::Decoder;
use wirepack::Encoder;
use wirepack::Value;
use wirepack::decode_value;
use wirepack::encode_value;

use crate::error::Error;
use crate::error::ErrorSpot;
use crate::error::Result;

/// The envelope format version written as the first byte of every frame.
pub const WIRE_VERSION: u8 = 0x01;

/// Answer carried with `ErrorSpot::Service`.
pub const SERVICE_NOT_FOUND: &str = "Service not found";

/// Answer carried with `ErrorSpot::Method`.
pub const METHOD_NOT_FOUND: &str = "Method not found";

/// A named method call against a named remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub service: String,
    pub method: String,
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: u64, service: impl Into<String>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self { id, service: service.into(), method: method.into(), params }
    }

    fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin("Request")?;
        enc.map_begin()?;

        write_map_id(enc, self.id)?;
        write_map_str(enc, "service", &self.service)?;
        write_map_str(enc, "method", &self.method)?;

        enc.variant_begin("params")?;
        enc.list_begin()?;
        for val in &self.params {
            encode_value(enc, val)?;
        }
        enc.list_end()?;
        enc.variant_end()?;

        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    fn decode_body(mut dec: Decoder) -> Result<Self> {
        let mut map = dec.map()?;
        let mut id = None;
        let mut service = None;
        let mut method = None;
        let mut params = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "id" => id = Some(read_id(&mut val)?),
                "service" => service = Some(val.str()?.to_string()),
                "method" => method = Some(val.str()?.to_string()),
                "params" => params = Some(read_params(&mut val)?),
                _ => val.skip()?,
            }
            val.finish()?;
        }

        Ok(Request {
            id: id.ok_or(Error::MissingField("id"))?,
            service: service.ok_or(Error::MissingField("service"))?,
            method: method.ok_or(Error::MissingField("method"))?,
            params: params.ok_or(Error::MissingField("params"))?,
        })
    }
}

/// The single answer to one [`Request`], correlated by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub answer: Value,
    pub error_spot: ErrorSpot,
}

impl Response {
    /// A successful result. `answer` may legitimately be `Value::Null`.
    pub fn ok(id: u64, answer: impl Into<Value>) -> Self {
        Self { id, answer: answer.into(), error_spot: ErrorSpot::None }
    }

    /// A failure at `spot`, described by `message`.
    pub fn failure(id: u64, spot: ErrorSpot, message: impl Into<String>) -> Self {
        Self { id, answer: Value::Str(message.into()), error_spot: spot }
    }

    pub fn service_not_found(id: u64) -> Self {
        Self::failure(id, ErrorSpot::Service, SERVICE_NOT_FOUND)
    }

    pub fn method_not_found(id: u64) -> Self {
        Self::failure(id, ErrorSpot::Method, METHOD_NOT_FOUND)
    }

    pub fn execution_failed(id: u64, description: impl Into<String>) -> Self {
        Self::failure(id, ErrorSpot::Execution, description)
    }

    pub fn is_error(&self) -> bool {
        self.error_spot.is_error()
    }

    fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin("Response")?;
        enc.map_begin()?;

        write_map_id(enc, self.id)?;

        enc.variant_begin("answer")?;
        encode_value(enc, &self.answer)?;
        enc.variant_end()?;

        enc.variant_begin("error_spot")?;
        encode_unit_variant(enc, self.error_spot.as_tag())?;
        enc.variant_end()?;

        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    fn decode_body(mut dec: Decoder) -> Result<Self> {
        let mut map = dec.map()?;
        let mut id = None;
        let mut answer = None;
        let mut error_spot = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "id" => id = Some(read_id(&mut val)?),
                "answer" => answer = Some(decode_value(&mut val)?),
                "error_spot" => {
                    let tag = decode_unit_variant(&mut val)?;
                    error_spot = Some(ErrorSpot::from_tag(tag)?);
                }
                _ => val.skip()?,
            }
            val.finish()?;
        }

        Ok(Response {
            id: id.ok_or(Error::MissingField("id"))?,
            answer: answer.ok_or(Error::MissingField("answer"))?,
            error_spot: error_spot.ok_or(Error::MissingField("error_spot"))?,
        })
    }
}

/// Any envelope that can appear on the shared duplex stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    /// The correlation id of the envelope.
    pub fn id(&self) -> u64 {
        match self {
            Frame::Request(req) => req.id,
            Frame::Response(resp) => resp.id,
        }
    }

    /// Encodes the frame body, version byte included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        match self {
            Frame::Request(req) => req.encode_into(&mut enc)?,
            Frame::Response(resp) => resp.encode_into(&mut enc)?,
        }
        let body = enc.into_bytes()?;

        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(WIRE_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes one complete frame body.
    ///
    /// Truncated or over-long input is rejected; a partial envelope is never returned.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&version, body)) = bytes.split_first() else {
            return Err(Error::EmptyFrame);
        };
        if version != WIRE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let mut dec = Decoder::new(body);
        let (msg_type, payload) = dec.variant()?;
        dec.finish()?;

        match msg_type {
            "Request" => Ok(Frame::Request(Request::decode_body(payload)?)),
            "Response" => Ok(Frame::Response(Response::decode_body(payload)?)),
            other => Err(Error::UnknownFrame(other.to_string())),
        }
    }
}

impl From<Request> for Frame {
    fn from(req: Request) -> Self { Frame::Request(req) }
}

impl From<Response> for Frame {
    fn from(resp: Response) -> Self { Frame::Response(resp) }
}

// Helper functions

/// Ids travel as the two's-complement bit pattern of the `u64`.
fn write_map_id(enc: &mut Encoder, id: u64) -> Result<()> {
    enc.variant_begin("id")?;
    enc.int(id as i64)?;
    enc.variant_end()?;
    Ok(())
}

fn read_id(dec: &mut Decoder) -> Result<u64> {
    Ok(dec.int()? as u64)
}

fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}

fn read_params(dec: &mut Decoder) -> Result<Vec<Value>> {
    let mut iter = dec.list()?;
    let mut params = Vec::new();
    while let Some(mut item) = iter.next()? {
        params.push(decode_value(&mut item)?);
        item.finish()?;
    }
    Ok(params)
}

/// Encode a unit variant (variant with a Null payload).
fn encode_unit_variant(enc: &mut Encoder, tag: &str) -> Result<()> {
    enc.variant_begin(tag)?;
    enc.null()?;
    enc.variant_end()?;
    Ok(())
}

/// Decode a unit variant and return its tag.
fn decode_unit_variant<'a>(dec: &mut Decoder<'a>) -> Result<&'a str> {
    let (tag, mut body) = dec.variant()?;
    body.null()?;
    body.finish()?;
    Ok(tag)
}
