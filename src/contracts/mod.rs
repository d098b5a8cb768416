//! Calldata encoding for the contracts the relayer talks to

pub mod safe;

pub use safe::{SafeSetup, SafeTransaction};
