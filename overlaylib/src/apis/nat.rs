//! Address translation for TCP and UDP over IPv4
//!
//! Both directions copy the packet, rewrite the addresses, fix the IPv4
//! total length and header checksum, recompute the transport checksum over
//! the new pseudo header and decode the result again.
//! Ports are never touched.

use pnet::packet::{
	ipv4::{self, MutableIpv4Packet},
	tcp::{self, MutableTcpPacket},
	udp::{self, MutableUdpPacket},
};
use std::{convert::TryFrom, net::Ipv4Addr};

use super::{NatError, Packet, Protocol};

/// Translation for a packet leaving a local workload
///
/// `new_dst` is the namespace ip of the chosen instance,
/// `new_src` the instance identity of the sender
pub fn outgoing_conversion(
	packet: &Packet,
	new_dst: Ipv4Addr,
	new_src: Ipv4Addr,
) -> Result<Packet, NatError> {
	rewrite(packet, new_src, new_dst)
}

/// Translation for a packet that arrived over the tunnel
pub fn ingoing_conversion(
	packet: &Packet,
	new_src: Ipv4Addr,
	new_dst: Ipv4Addr,
) -> Result<Packet, NatError> {
	rewrite(packet, new_src, new_dst)
}

fn rewrite(packet: &Packet, src: Ipv4Addr, dst: Ipv4Addr) -> Result<Packet, NatError> {
	let segment = packet.segment().ok_or(NatError::Unsupported)?;
	let protocol = segment.tuple().protocol;
	let mut buf = segment.as_bytes().to_vec();
	let len = buf.len();
	let total = u16::try_from(len).map_err(|_| NatError::Oversized(len))?;

	let header_len = {
		let mut ip = MutableIpv4Packet::new(&mut buf).ok_or(NatError::Truncated(len))?;
		ip.set_source(src);
		ip.set_destination(dst);
		ip.set_total_length(total);
		let sum = ipv4::checksum(&ip.to_immutable());
		ip.set_checksum(sum);
		usize::from(ip.get_header_length()) * 4
	};

	let l4 = buf
		.get_mut(header_len..)
		.ok_or(NatError::Truncated(len))?;
	match protocol {
		Protocol::Tcp => {
			let mut seg = MutableTcpPacket::new(l4).ok_or(NatError::Truncated(len))?;
			let sum = tcp::ipv4_checksum(&seg.to_immutable(), &src, &dst);
			seg.set_checksum(sum);
		}
		Protocol::Udp => {
			let mut dgram = MutableUdpPacket::new(l4).ok_or(NatError::Truncated(len))?;
			let sum = udp::ipv4_checksum(&dgram.to_immutable(), &src, &dst);
			dgram.set_checksum(sum);
		}
	}

	Ok(Packet::decode(&buf)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::packet::tests::build;
	use pnet::packet::{ipv4::Ipv4Packet, tcp::TcpPacket, udp::UdpPacket};

	fn assert_checksums(packet: &Packet) {
		let bytes = packet.as_bytes().unwrap();
		let ip = Ipv4Packet::new(bytes).unwrap();
		assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));
		assert_eq!(usize::from(ip.get_total_length()), bytes.len());
		let (src, dst) = (ip.get_source(), ip.get_destination());
		match packet {
			Packet::Tcp(_) => {
				let seg = TcpPacket::new(&bytes[20..]).unwrap();
				assert_eq!(seg.get_checksum(), tcp::ipv4_checksum(&seg, &src, &dst));
			}
			Packet::Udp(_) => {
				let dgram = UdpPacket::new(&bytes[20..]).unwrap();
				assert_eq!(dgram.get_checksum(), udp::ipv4_checksum(&dgram, &src, &dst));
			}
			Packet::Other => panic!("not translated"),
		}
	}

	#[test]
	fn outgoing_rewrites_addresses_only() {
		let raw = build(
			Protocol::Tcp,
			Ipv4Addr::new(172, 19, 1, 1),
			Ipv4Addr::new(172, 30, 255, 255),
			666,
			80,
			b"GET / HTTP/1.1\r\n\r\n",
		);
		let packet = Packet::decode(&raw).unwrap();
		let out = outgoing_conversion(
			&packet,
			Ipv4Addr::new(172, 19, 2, 12),
			Ipv4Addr::new(172, 19, 2, 254),
		)
		.unwrap();

		let tuple = out.tuple().unwrap();
		assert_eq!(tuple.dst_ip, Ipv4Addr::new(172, 19, 2, 12));
		assert_eq!(tuple.src_ip, Ipv4Addr::new(172, 19, 2, 254));
		assert_eq!(tuple.src_port, 666);
		assert_eq!(tuple.dst_port, 80);
		assert_checksums(&out);
		// the input is left untouched
		assert_eq!(packet.as_bytes().unwrap(), &raw[..]);
	}

	#[test]
	fn udp_checksums_follow_new_addresses() {
		let raw = build(
			Protocol::Udp,
			Ipv4Addr::new(10, 30, 0, 2),
			Ipv4Addr::new(172, 30, 0, 9),
			40000,
			53,
			b"\x12\x34query",
		);
		let packet = Packet::decode(&raw).unwrap();
		let out = ingoing_conversion(
			&packet,
			Ipv4Addr::new(172, 30, 0, 9),
			Ipv4Addr::new(10, 30, 0, 2),
		)
		.unwrap();
		assert_eq!(out.tuple().unwrap().protocol, Protocol::Udp);
		assert_checksums(&out);
	}

	#[test]
	fn round_trip_restores_original() {
		let src = Ipv4Addr::new(10, 30, 0, 2);
		let dst = Ipv4Addr::new(172, 30, 1, 1);
		for protocol in [Protocol::Tcp, Protocol::Udp].iter() {
			let raw = build(*protocol, src, dst, 1234, 8080, b"payload");
			let packet = Packet::decode(&raw).unwrap();
			let there = outgoing_conversion(
				&packet,
				Ipv4Addr::new(10, 31, 0, 5),
				Ipv4Addr::new(172, 30, 9, 9),
			)
			.unwrap();
			let back = ingoing_conversion(&there, src, dst).unwrap();
			assert_eq!(back.tuple(), packet.tuple());
			assert_eq!(back.as_bytes(), packet.as_bytes());
		}
	}

	#[test]
	fn other_is_unsupported() {
		let res = outgoing_conversion(
			&Packet::Other,
			Ipv4Addr::new(10, 0, 0, 1),
			Ipv4Addr::new(10, 0, 0, 2),
		);
		assert!(matches!(res, Err(NatError::Unsupported)));
	}
}
