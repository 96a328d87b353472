//! This is the library module that provides structures like
//! Packet, FiveTuple, TranslationTable, Environment and the NAT conversions
//!
//! These structures and functions let the proxy decode, translate and route
//! packets without having to know how service addresses are resolved

pub mod apis;

pub use apis::*;
