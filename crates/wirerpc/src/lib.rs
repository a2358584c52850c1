//! # Wirerpc
//!
//! The envelope layer of wirecall: what a call and its answer look like on the wire.
//!
//! ## Philosophy
//! - **Two envelopes**: A [`Request`] names a service, a method and positional
//!   parameters; a [`Response`] carries an answer and an [`ErrorSpot`].
//! - **One stream**: Both envelopes share a duplex stream, so every frame says which
//!   one it is. The transport decides how frames are delimited; this crate only
//!   turns one frame body into one envelope and back.
//! - **Uniform failures**: Resolution and execution failures are ordinary responses
//!   with a non-`None` spot. Only unreadable frames are errors here.

mod error;
mod frame;


pub use error::Error;
pub use error::ErrorSpot;
pub use error::Result;
pub use frame::Frame;
pub use frame::METHOD_NOT_FOUND;
pub use frame::Request;
pub use frame::Response;
pub use frame::SERVICE_NOT_FOUND;
pub use frame::WIRE_VERSION;

pub use wirepack::Value;
