//! Domain vocabulary shared across crates

pub mod kind;
