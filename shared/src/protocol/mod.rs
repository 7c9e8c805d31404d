//! Wire protocol definitions
//!
//! JSON bodies exchanged on `POST /metrics` between clients and the
//! aggregator service.

pub mod wire;
