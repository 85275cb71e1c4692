//! Ratekeeper Common Types
//!
//! This crate contains the value types shared by the rate core and the daemon:
//! currency codes, rate pairs, latest-rate records, history entries and time helpers.

pub mod currency;
pub mod rate;
pub mod error;
pub mod time;

pub use currency::*;
pub use rate::*;
pub use error::*;
pub use time::*;
