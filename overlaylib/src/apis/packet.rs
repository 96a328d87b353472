//! Decoded packets as they are read from the TUN device or the tunnel socket
//!
//! The five tuple extracts and stores the following information from the packets
//! 	Source IP
//! 	Destination IP
//! 	Source Port
//! 	Destination Port
//! 	Transport protocol
//!
//! A decoded packet is an immutable value. Translation produces a new packet.

use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use std::{fmt, net::Ipv4Addr};

use super::PacketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
	Tcp,
	Udp,
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Protocol::Tcp => write!(f, "tcp"),
			Protocol::Udp => write!(f, "udp"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Addressing view of a TCP or UDP packet
pub struct FiveTuple {
	pub src_ip: Ipv4Addr,
	pub dst_ip: Ipv4Addr,
	pub src_port: u16,
	pub dst_port: u16,
	pub protocol: Protocol,
}

impl fmt::Display for FiveTuple {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} {}:{} -> {}:{}",
			self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port
		)
	}
}

/// A TCP or UDP segment over IPv4 together with its serialized bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
	tuple: FiveTuple,
	raw: Vec<u8>,
}

impl Segment {
	pub fn tuple(&self) -> &FiveTuple {
		&self.tuple
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.raw
	}
}

/// Tagged packet variant
///
/// Everything that is not TCP or UDP over IPv4 decodes to `Other`
/// and is dropped before translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
	Tcp(Segment),
	Udp(Segment),
	Other,
}

impl Packet {
	/// Parse a raw IP frame
	///
	/// Bytes past the IPv4 total length are not kept
	pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
		let sliced = SlicedPacket::from_ip(buf)?;
		let ip = match sliced.ip {
			Some(InternetSlice::Ipv4(ip, _)) => ip,
			Some(_) => return Ok(Packet::Other),
			None => return Err(PacketError::NotIp),
		};
		let src_ip = ip.source_addr();
		let dst_ip = ip.destination_addr();
		let total = usize::from(ip.total_len()).min(buf.len());
		let raw = buf[..total].to_vec();

		let packet = match sliced.transport {
			Some(TransportSlice::Tcp(tcp)) => Packet::Tcp(Segment {
				tuple: FiveTuple {
					src_ip,
					dst_ip,
					src_port: tcp.source_port(),
					dst_port: tcp.destination_port(),
					protocol: Protocol::Tcp,
				},
				raw,
			}),
			Some(TransportSlice::Udp(udp)) => Packet::Udp(Segment {
				tuple: FiveTuple {
					src_ip,
					dst_ip,
					src_port: udp.source_port(),
					dst_port: udp.destination_port(),
					protocol: Protocol::Udp,
				},
				raw,
			}),
			_ => Packet::Other,
		};
		Ok(packet)
	}

	pub fn segment(&self) -> Option<&Segment> {
		match self {
			Packet::Tcp(s) | Packet::Udp(s) => Some(s),
			Packet::Other => None,
		}
	}

	/// The five tuple, for TCP and UDP packets only
	pub fn tuple(&self) -> Option<&FiveTuple> {
		self.segment().map(Segment::tuple)
	}

	pub fn as_bytes(&self) -> Option<&[u8]> {
		self.segment().map(Segment::as_bytes)
	}
}
