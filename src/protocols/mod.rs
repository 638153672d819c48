//! Protocol implementations.
//!
//! Each protocol plugs into the connection engine through
//! [`crate::codec::Codec`].
//!
//! - `ndtp`: NDTP telemetry protocol spoken by tracking devices

pub mod ndtp;
