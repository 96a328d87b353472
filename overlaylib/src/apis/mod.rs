//! This module defines the structures the overlay proxy is built from
//!
//! Errors related to packet decoding, address translation,
//! the translation table and the control plane
//!
//! The network environment that owns the translation table

mod env;
mod nat;
mod packet;
mod query;
mod table;

pub use env::*;
pub use nat::*;
pub use packet::*;
pub use query::*;
pub use table::*;

use etherparse::ReadError;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacketError {
	#[error("Not an IP packet")]
	NotIp,
	#[error("Read Error: {0:?}")]
	ReadError(ReadError),
}

impl From<ReadError> for PacketError {
	fn from(e: ReadError) -> Self {
		Self::ReadError(e)
	}
}

#[derive(Error, Debug)]
pub enum NatError {
	/// Only TCP and UDP over IPv4 are rewritten
	#[error("packet is not TCP or UDP over IPv4")]
	Unsupported,
	#[error("buffer of {0} bytes is too short for the headers")]
	Truncated(usize),
	#[error("packet of {0} bytes does not fit an IPv4 total length")]
	Oversized(usize),
	#[error("translated packet does not decode: {0}")]
	Packet(#[from] PacketError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
	/// The entry was not stored
	#[error("invalid table entry: {0}")]
	InvalidEntry(&'static str),
	#[error("no table entry owns namespace ip {0}")]
	NotFound(Ipv4Addr),
}

#[derive(Error, Debug)]
pub enum QueryError {
	#[error("table query failed: {0}")]
	Http(#[from] reqwest::Error),
	/// Treated by callers as a cache miss
	#[error("malformed control response: {0}")]
	MalformedControlResponse(String),
}

#[derive(Error, Debug)]
pub enum EnvError {
	#[error("address space exhausted")]
	AddressSpaceExhausted,
	#[error("workload {0} is already deployed")]
	AlreadyDeployed(String),
	#[error("workload {0} is not deployed")]
	UnknownWorkload(String),
	#[error("provisioning failed: {0}")]
	Provision(String),
	#[error(transparent)]
	Table(#[from] TableError),
}
