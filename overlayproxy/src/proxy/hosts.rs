//! The host cache
//!
//! Which node hosts a namespace ip, as last learned from the translation table.

use crossbeam::sync::ShardedLock;
use ring_cache::RingBuf;
use std::net::Ipv4Addr;

pub const DEFAULT_HOSTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEntry {
	pub namespace_ip: Ipv4Addr,
	pub node_ip: Ipv4Addr,
	pub node_port: u16,
}

#[derive(Debug)]
pub struct HostCache {
	ring: ShardedLock<RingBuf<HostEntry>>,
}

impl HostCache {
	pub fn new(capacity: usize) -> Self {
		Self {
			ring: ShardedLock::new(RingBuf::new(capacity)),
		}
	}

	pub fn get(&self, namespace_ip: Ipv4Addr) -> Option<HostEntry> {
		let find = |ring: &RingBuf<HostEntry>| {
			ring.find(|e| e.namespace_ip == namespace_ip).copied()
		};
		match self.ring.read() {
			Ok(ring) => find(&ring),
			Err(p_err) => find(&p_err.into_inner()),
		}
	}

	/// Store an entry, overwriting the one for the same namespace ip
	pub fn add(&self, entry: HostEntry) {
		let mut ring = match self.ring.write() {
			Ok(ring) => ring,
			Err(p_err) => p_err.into_inner(),
		};
		ring.upsert(entry, |e| e.namespace_ip == entry.namespace_ip);
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		match self.ring.read() {
			Ok(ring) => ring.len(),
			Err(p_err) => p_err.into_inner().len(),
		}
	}
}

impl Default for HostCache {
	fn default() -> Self {
		Self::new(DEFAULT_HOSTS)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn host(last: u8, node_last: u8) -> HostEntry {
		HostEntry {
			namespace_ip: Ipv4Addr::new(172, 19, 2, last),
			node_ip: Ipv4Addr::new(192, 168, 1, node_last),
			node_port: 50011,
		}
	}

	#[test]
	fn add_and_get() {
		let cache = HostCache::default();
		cache.add(host(12, 10));
		assert_eq!(cache.get(Ipv4Addr::new(172, 19, 2, 12)), Some(host(12, 10)));
		assert!(cache.get(Ipv4Addr::new(172, 19, 2, 13)).is_none());
	}

	#[test]
	fn same_namespace_ip_is_overwritten() {
		let cache = HostCache::default();
		cache.add(host(12, 10));
		cache.add(host(12, 11));
		assert_eq!(cache.len(), 1);
		assert_eq!(
			cache.get(Ipv4Addr::new(172, 19, 2, 12)).unwrap().node_ip,
			Ipv4Addr::new(192, 168, 1, 11)
		);
	}

	#[test]
	fn overflow_evicts_first_host() {
		let cache = HostCache::default();
		for last in 0..=DEFAULT_HOSTS as u8 {
			cache.add(host(last, 10));
		}
		assert_eq!(cache.len(), DEFAULT_HOSTS);
		assert!(cache.get(Ipv4Addr::new(172, 19, 2, 0)).is_none());
		assert!(cache.get(Ipv4Addr::new(172, 19, 2, 1)).is_some());
		assert!(cache
			.get(Ipv4Addr::new(172, 19, 2, DEFAULT_HOSTS as u8))
			.is_some());
	}
}
