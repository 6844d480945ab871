//! Decoded sensor record schema
//!
//! This module defines the generic, vendor-agnostic record handed from the
//! decoder adapter to the signal extractors. Payload access is explicit and
//! optional: a missing key yields `None` rather than an error.

mod record;

pub use record::*;
