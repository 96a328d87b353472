//! The proxy cache
//!
//! Remembers the translation chosen for every flow leaving a local workload.
//! Sessions are grouped per source ip, each group is a ring of the most
//! recently added sessions, so busy sources do not evict each other.
//! Groups nobody touched for `BUCKET_IDLE` are dropped when a new source shows up.

use crossbeam::sync::{ShardedLock, ShardedLockWriteGuard};
use ring_cache::RingBuf;
use std::{
	collections::HashMap,
	net::Ipv4Addr,
	time::{Duration, Instant},
};

pub const DEFAULT_SESSIONS: usize = 10;
pub const BUCKET_IDLE: Duration = Duration::from_secs(300);

/// Translation decision for one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionEntry {
	/// Original source of the flow
	pub src_ip: Ipv4Addr,
	/// Namespace ip of the chosen instance
	pub dst_ip: Ipv4Addr,
	/// Address the flow was sent to
	pub dst_service_ip: Ipv4Addr,
	/// Instance ip of the chosen instance, replies may carry it as source
	pub dst_instance_ip: Option<Ipv4Addr>,
	/// Source written into outgoing packets
	pub src_instance_ip: Ipv4Addr,
	pub src_port: u16,
	pub dst_port: u16,
}

impl ConversionEntry {
	fn answered_by(&self, ip: Ipv4Addr) -> bool {
		self.dst_ip == ip || self.dst_instance_ip == Some(ip)
	}

	fn sent_from(&self, ip: Ipv4Addr) -> bool {
		self.src_ip == ip || self.src_instance_ip == ip
	}

	fn replied_by(&self, to: Ipv4Addr, from: Ipv4Addr, dst_port: u16, src_port: u16) -> bool {
		self.sent_from(to)
			&& self.answered_by(from)
			&& self.src_port == dst_port
			&& self.dst_port == src_port
	}
}

#[derive(Debug)]
struct ConversionList {
	last_used: Instant,
	ring: RingBuf<ConversionEntry>,
}

#[derive(Debug)]
pub struct ProxyCache {
	lists: ShardedLock<HashMap<Ipv4Addr, ConversionList>>,
	capacity: usize,
	idle: Duration,
}

impl ProxyCache {
	pub fn new(capacity: usize) -> Self {
		Self::with_idle(capacity, BUCKET_IDLE)
	}

	pub fn with_idle(capacity: usize, idle: Duration) -> Self {
		Self {
			lists: ShardedLock::new(HashMap::new()),
			capacity,
			idle,
		}
	}

	// Every access takes the write lock because lookups stamp last_used.
	// This serializes readers.
	fn lock(&self) -> ShardedLockWriteGuard<'_, HashMap<Ipv4Addr, ConversionList>> {
		match self.lists.write() {
			Ok(lists) => lists,
			Err(p_err) => p_err.into_inner(),
		}
	}

	/// Session of an outgoing flow to a service ip
	pub fn retrieve_by_service_ip(
		&self,
		src_ip: Ipv4Addr,
		src_port: u16,
		dst_service_ip: Ipv4Addr,
	) -> Option<ConversionEntry> {
		let mut lists = self.lock();
		let list = lists.get_mut(&src_ip)?;
		list.last_used = Instant::now();
		list.ring
			.find(|e| e.src_port == src_port && e.dst_service_ip == dst_service_ip)
			.copied()
	}

	/// Session a reply belongs to
	///
	/// `to` and `from` are the destination and source of the reply. The reply
	/// is addressed to the flow's source, or to the source written into the
	/// flow when the remote side kept it. Its destination port is the port the
	/// flow left from and its source port the one the flow was sent to.
	pub fn retrieve_by_instance_ip(
		&self,
		to: Ipv4Addr,
		from: Ipv4Addr,
		dst_port: u16,
		src_port: u16,
	) -> Option<ConversionEntry> {
		let mut lists = self.lock();
		if let Some(list) = lists.get_mut(&to) {
			let found = list
				.ring
				.find(|e| e.replied_by(to, from, dst_port, src_port))
				.copied();
			if found.is_some() {
				list.last_used = Instant::now();
				return found;
			}
		}
		for list in lists.values_mut() {
			let found = list
				.ring
				.find(|e| e.replied_by(to, from, dst_port, src_port))
				.copied();
			if found.is_some() {
				list.last_used = Instant::now();
				return found;
			}
		}
		None
	}

	/// Store a session
	/// A session from the same source ip and port is overwritten
	pub fn add(&self, entry: ConversionEntry) {
		let capacity = self.capacity;
		let idle = self.idle;
		let mut lists = self.lock();
		if !lists.contains_key(&entry.src_ip) {
			let before = lists.len();
			lists.retain(|_, list| list.last_used.elapsed() < idle);
			if lists.len() < before {
				log::debug!("dropped {} idle session groups", before - lists.len());
			}
		}
		let list = lists
			.entry(entry.src_ip)
			.or_insert_with(|| ConversionList {
				last_used: Instant::now(),
				ring: RingBuf::new(capacity),
			});
		list.last_used = Instant::now();
		if let Some(old) = list.ring.upsert(entry, |e| e.src_port == entry.src_port) {
			log::trace!(
				"session {}:{} -> {} replaced",
				old.src_ip,
				old.src_port,
				old.dst_service_ip
			);
		}
	}

	/// Sessions held for one source ip
	#[cfg(test)]
	pub fn sessions(&self, src_ip: Ipv4Addr) -> Vec<ConversionEntry> {
		self.lock()
			.get(&src_ip)
			.map(|list| list.ring.iter().copied().collect())
			.unwrap_or_default()
	}
}

impl Default for ProxyCache {
	fn default() -> Self {
		Self::new(DEFAULT_SESSIONS)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn session(src_port: u16, dst_last: u8) -> ConversionEntry {
		ConversionEntry {
			src_ip: Ipv4Addr::new(172, 19, 1, 1),
			dst_ip: Ipv4Addr::new(172, 19, 2, dst_last),
			dst_service_ip: Ipv4Addr::new(172, 30, 0, 1),
			dst_instance_ip: Some(Ipv4Addr::new(172, 30, 1, dst_last)),
			src_instance_ip: Ipv4Addr::new(172, 30, 1, 254),
			src_port,
			dst_port: 80,
		}
	}

	#[test]
	fn forward_lookup() {
		let cache = ProxyCache::default();
		let s = session(666, 12);
		cache.add(s);
		assert_eq!(
			cache.retrieve_by_service_ip(s.src_ip, 666, s.dst_service_ip),
			Some(s)
		);
		assert!(cache
			.retrieve_by_service_ip(s.src_ip, 667, s.dst_service_ip)
			.is_none());
		assert!(cache
			.retrieve_by_service_ip(Ipv4Addr::new(172, 19, 1, 2), 666, s.dst_service_ip)
			.is_none());
	}

	#[test]
	fn reverse_lookup() {
		let cache = ProxyCache::default();
		let s = session(666, 12);
		cache.add(s);

		// reply straight from the namespace ip
		assert_eq!(
			cache.retrieve_by_instance_ip(s.src_ip, Ipv4Addr::new(172, 19, 2, 12), 666, 80),
			Some(s)
		);
		// reply translated by the remote proxy
		assert_eq!(
			cache.retrieve_by_instance_ip(s.src_ip, Ipv4Addr::new(172, 30, 1, 12), 666, 80),
			Some(s)
		);
		// reply to the source written into the flow
		assert_eq!(
			cache.retrieve_by_instance_ip(
				s.src_instance_ip,
				Ipv4Addr::new(172, 19, 2, 12),
				666,
				80
			),
			Some(s)
		);
		// ports must be mirrored
		assert!(cache
			.retrieve_by_instance_ip(s.src_ip, Ipv4Addr::new(172, 19, 2, 12), 80, 666)
			.is_none());
		// somebody else's reply
		assert!(cache
			.retrieve_by_instance_ip(
				Ipv4Addr::new(172, 19, 1, 7),
				Ipv4Addr::new(172, 19, 2, 12),
				666,
				80
			)
			.is_none());
	}

	#[test]
	fn replies_reach_the_source_they_are_addressed_to() {
		let cache = ProxyCache::default();
		let mut sources = Vec::new();
		for last in 1..=20u8 {
			let mut s = session(666, 12);
			s.src_ip = Ipv4Addr::new(172, 19, 1, last);
			s.src_instance_ip = s.src_ip;
			cache.add(s);
			sources.push(s);
		}
		for s in sources {
			let found = cache
				.retrieve_by_instance_ip(s.src_ip, Ipv4Addr::new(172, 19, 2, 12), 666, 80)
				.unwrap();
			assert_eq!(found.src_ip, s.src_ip);
		}
	}

	#[test]
	fn idle_groups_are_dropped_for_new_sources() {
		let cache = ProxyCache::with_idle(DEFAULT_SESSIONS, Duration::from_secs(0));
		let first = session(666, 12);
		cache.add(first);
		// the same source keeps its group
		cache.add(session(667, 12));
		assert_eq!(cache.sessions(first.src_ip).len(), 2);

		let mut other = session(666, 12);
		other.src_ip = Ipv4Addr::new(172, 19, 1, 9);
		cache.add(other);
		assert!(cache.sessions(first.src_ip).is_empty());
		assert_eq!(cache.sessions(other.src_ip), vec![other]);
	}

	#[test]
	fn same_source_port_is_overwritten() {
		let cache = ProxyCache::default();
		cache.add(session(666, 12));
		cache.add(session(666, 13));
		let sessions = cache.sessions(Ipv4Addr::new(172, 19, 1, 1));
		assert_eq!(sessions.len(), 1);
		assert_eq!(sessions[0].dst_ip, Ipv4Addr::new(172, 19, 2, 13));
	}

	#[test]
	fn overflow_evicts_first_session() {
		let cache = ProxyCache::default();
		for port in 0..=DEFAULT_SESSIONS as u16 {
			cache.add(session(1000 + port, 12));
		}
		let src = Ipv4Addr::new(172, 19, 1, 1);
		let sip = Ipv4Addr::new(172, 30, 0, 1);
		assert_eq!(cache.sessions(src).len(), DEFAULT_SESSIONS);
		assert!(cache.retrieve_by_service_ip(src, 1000, sip).is_none());
		for port in 1..=DEFAULT_SESSIONS as u16 {
			assert!(cache.retrieve_by_service_ip(src, 1000 + port, sip).is_some());
		}
	}

	#[test]
	fn sources_do_not_evict_each_other() {
		let cache = ProxyCache::new(2);
		let mut other = session(5000, 12);
		other.src_ip = Ipv4Addr::new(172, 19, 1, 9);
		cache.add(other);
		for port in 0..4 {
			cache.add(session(1000 + port, 12));
		}
		assert_eq!(cache.sessions(other.src_ip), vec![other]);
	}
}
