//! This module defines the overlay proxy
//!
//! The OverlayProxy owns everything the data path needs:
//! the network environment (and with it the translation table),
//! the proxy cache of translated flows, the host cache
//! and the pool of tunnel sockets
//!
//! Packets read from the TUN device go through the outgoing path:
//! destinations inside the proxy subnetwork are service ips and get translated
//! to the namespace ip of an instance, then the packet is tunneled to the node
//! hosting that namespace ip.
//!
//! Packets read from the tunnel go through the ingoing path:
//! replies to a translated flow get their service ip back,
//! then the packet is written to the TUN device.

mod hosts;
mod listen;
mod session;
mod tunnel;

pub(crate) use hosts::*;
pub(crate) use listen::*;
pub(crate) use session::*;
pub(crate) use tunnel::*;

use ipnetwork::Ipv4Network;
use overlaylib::{ingoing_conversion, outgoing_conversion, Environment, NatError, Packet};
use overlaytun::Device;
use std::{net::Ipv4Addr, sync::Arc};
use thiserror::Error;

/// Sends of one packet before it is dropped
pub(crate) const MAX_ATTEMPTS: u32 = 10;

#[derive(Error, Debug)]
pub(crate) enum ProxyError {
	#[error("no instance or node known for {0}")]
	UnresolvedDestination(Ipv4Addr),
	#[error(transparent)]
	Translation(#[from] NatError),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProxySettings {
	/// Range of the service ips
	pub subnetwork: Ipv4Network,
	/// Address of this node
	pub local_ip: Ipv4Addr,
	pub proxy_cache_size: usize,
	pub host_cache_size: usize,
}

pub(crate) struct OverlayProxy<T: Tunnel = TunnelPool> {
	device: Arc<dyn Device>,
	env: Environment,
	cache: ProxyCache,
	hosts: HostCache,
	pool: T,
	subnetwork: Ipv4Network,
	local_ip: Ipv4Addr,
}

impl OverlayProxy {
	pub(crate) fn new(device: Arc<dyn Device>, env: Environment, settings: ProxySettings) -> Self {
		Self::with_tunnel(device, env, settings, TunnelPool::new())
	}
}

impl<T: Tunnel> OverlayProxy<T> {
	pub(crate) fn with_tunnel(
		device: Arc<dyn Device>,
		env: Environment,
		settings: ProxySettings,
		pool: T,
	) -> Self {
		Self {
			device,
			env,
			cache: ProxyCache::new(settings.proxy_cache_size),
			hosts: HostCache::new(settings.host_cache_size),
			pool,
			subnetwork: settings.subnetwork,
			local_ip: settings.local_ip,
		}
	}

	pub(crate) fn device(&self) -> &Arc<dyn Device> {
		&self.device
	}

	#[cfg(test)]
	pub(crate) fn env(&self) -> &Environment {
		&self.env
	}

	/// Translate a packet leaving a local workload
	///
	/// Destinations outside the proxy subnetwork are left alone
	pub(crate) fn outgoing_proxy(&self, packet: &Packet) -> Result<Packet, ProxyError> {
		let tuple = match packet.tuple() {
			Some(tuple) => *tuple,
			None => return Err(NatError::Unsupported.into()),
		};
		if !self.subnetwork.contains(tuple.dst_ip) {
			return Ok(packet.clone());
		}

		let entry = match self
			.cache
			.retrieve_by_service_ip(tuple.src_ip, tuple.src_port, tuple.dst_ip)
		{
			Some(entry) => {
				log::trace!("session hit for {}", tuple);
				entry
			}
			None => {
				let target = self
					.env
					.resolve_service_ip(tuple.dst_ip)
					.ok_or(ProxyError::UnresolvedDestination(tuple.dst_ip))?;
				self.hosts.add(HostEntry {
					namespace_ip: target.namespace_ip,
					node_ip: target.node_ip,
					node_port: target.node_port,
				});
				let src_instance_ip = self
					.env
					.entry_by_namespace_ip(tuple.src_ip)
					.and_then(|e| e.instance_ip())
					.unwrap_or(tuple.src_ip);
				let entry = ConversionEntry {
					src_ip: tuple.src_ip,
					dst_ip: target.namespace_ip,
					dst_service_ip: tuple.dst_ip,
					dst_instance_ip: target.instance_ip(),
					src_instance_ip,
					src_port: tuple.src_port,
					dst_port: tuple.dst_port,
				};
				log::debug!(
					"{} resolved to instance {} at {}",
					tuple,
					target.instance_number,
					target.namespace_ip
				);
				self.cache.add(entry);
				entry
			}
		};
		Ok(outgoing_conversion(
			packet,
			entry.dst_ip,
			entry.src_instance_ip,
		)?)
	}

	/// Translate a packet that arrived over the tunnel
	///
	/// Only replies to a known session are rewritten
	pub(crate) fn ingoing_proxy(&self, packet: &Packet) -> Result<Packet, ProxyError> {
		let tuple = match packet.tuple() {
			Some(tuple) => *tuple,
			None => return Err(NatError::Unsupported.into()),
		};
		match self
			.cache
			.retrieve_by_instance_ip(tuple.dst_ip, tuple.src_ip, tuple.dst_port, tuple.src_port)
		{
			Some(entry) => {
				log::trace!("reply {} to session from {}", tuple, entry.dst_service_ip);
				Ok(ingoing_conversion(
					packet,
					entry.dst_service_ip,
					entry.src_ip,
				)?)
			}
			None => Ok(packet.clone()),
		}
	}

	/// Outgoing path: translate, locate the node, tunnel
	pub(crate) fn outgoing_message(&self, packet: &Packet) {
		let translated = match self.outgoing_proxy(packet) {
			Ok(p) => p,
			Err(e) => {
				log::debug!("dropping outgoing packet: {}", e);
				return;
			}
		};
		let dst = match translated.tuple() {
			Some(tuple) => tuple.dst_ip,
			None => return,
		};
		match self.locate_remote_address(dst) {
			Some((node_ip, node_port)) => {
				log::trace!("sending packet for {} to {}:{}", dst, node_ip, node_port);
				self.forward(node_ip, node_port, &translated, 0);
			}
			None => log::debug!("dropping outgoing packet: {}", ProxyError::UnresolvedDestination(dst)),
		}
	}

	/// Ingoing path: translate and hand to the device
	pub(crate) fn ingoing_message(&self, packet: &Packet) {
		let translated = match self.ingoing_proxy(packet) {
			Ok(p) => p,
			Err(e) => {
				log::debug!("dropping ingoing packet: {}", e);
				return;
			}
		};
		if let Some(bytes) = translated.as_bytes() {
			if let Err(e) = self.device.send(bytes) {
				log::error!("writing to {} failed: {}", self.device.name(), e);
			}
		}
	}

	/// Node and tunnel port hosting `ip`
	///
	/// The host cache is asked first, then the translation table by
	/// namespace ip and finally by instance ip
	pub(crate) fn locate_remote_address(&self, ip: Ipv4Addr) -> Option<(Ipv4Addr, u16)> {
		if let Some(host) = self.hosts.get(ip) {
			return Some((host.node_ip, host.node_port));
		}
		let entry = self
			.env
			.entry_by_namespace_ip(ip)
			.or_else(|| self.env.entry_by_instance_ip(ip))?;
		log::debug!("{} is hosted by {}:{}", ip, entry.node_ip, entry.node_port);
		self.hosts.add(HostEntry {
			namespace_ip: ip,
			node_ip: entry.node_ip,
			node_port: entry.node_port,
		});
		Some((entry.node_ip, entry.node_port))
	}

	/// Tunnel a packet to a node
	///
	/// Packets for this node skip the socket and take the ingoing path.
	/// A failed send closes the socket and retries on a fresh one.
	pub(crate) fn forward(&self, dst: Ipv4Addr, port: u16, packet: &Packet, attempt: u32) {
		if attempt >= MAX_ATTEMPTS {
			log::warn!(
				"dropping packet for {}:{} after {} attempts",
				dst,
				port,
				attempt
			);
			return;
		}
		if dst == self.local_ip {
			log::trace!("forwarding packet locally");
			self.ingoing_message(packet);
			return;
		}
		let bytes = match packet.as_bytes() {
			Some(bytes) => bytes,
			None => return,
		};
		if let Err(e) = self.pool.send(dst, port, bytes) {
			log::warn!("send to {}:{} failed (attempt {}): {}", dst, port, attempt + 1, e);
			self.pool.evict(dst, port);
			self.forward(dst, port, packet, attempt + 1);
		}
	}
}
