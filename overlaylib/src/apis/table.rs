//! The translation table
//!
//! Authoritative directory of running instances. Each entry maps
//! an instance to the node hosting it, its namespace ip and the service
//! ips it answers to. Entries are never changed in place, an update is a
//! remove followed by an add.

use crossbeam::sync::{ShardedLock, ShardedLockReadGuard, ShardedLockWriteGuard};
use rand::seq::SliceRandom;
use std::{fmt, net::Ipv4Addr, str::FromStr};

use super::TableError;

const NAME_MAX: usize = 10;

/// Resolution policy of a service ip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceIpType {
	/// Pinned to one instance
	InstanceNumber,
	/// Topology aware; resolved like RoundRobin for now
	Closest,
	RoundRobin,
}

impl FromStr for ServiceIpType {
	type Err = String;

	/// Accepts the names in any case, with or without separators,
	/// and the ordinals 0, 1 and 2
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let norm: String = s
			.chars()
			.filter(|c| c.is_ascii_alphanumeric())
			.map(|c| c.to_ascii_lowercase())
			.collect();
		match norm.as_str() {
			"instancenumber" | "instanceip" | "0" => Ok(ServiceIpType::InstanceNumber),
			"closest" | "1" => Ok(ServiceIpType::Closest),
			"roundrobin" | "2" => Ok(ServiceIpType::RoundRobin),
			_ => Err(format!("unknown service ip type {:?}", s)),
		}
	}
}

impl fmt::Display for ServiceIpType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ServiceIpType::InstanceNumber => "InstanceNumber",
			ServiceIpType::Closest => "Closest",
			ServiceIpType::RoundRobin => "RoundRobin",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceIp {
	pub ip_type: ServiceIpType,
	pub address: Ipv4Addr,
}

impl ServiceIp {
	pub fn new(ip_type: ServiceIpType, address: Ipv4Addr) -> Self {
		Self { ip_type, address }
	}
}

/// One running instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
	pub app_name: String,
	pub app_namespace: String,
	pub service_name: String,
	pub service_namespace: String,
	pub instance_number: u32,
	pub cluster: u32,
	pub node_ip: Ipv4Addr,
	pub node_port: u16,
	pub namespace_ip: Ipv4Addr,
	pub service_ips: Vec<ServiceIp>,
}

impl TableEntry {
	/// Check the entry invariants
	/// The unspecified address stands for a missing ip
	pub fn validate(&self) -> Result<(), TableError> {
		let names = [
			(&self.app_name, "app name"),
			(&self.app_namespace, "app namespace"),
			(&self.service_name, "service name"),
			(&self.service_namespace, "service namespace"),
		];
		for (name, what) in names.iter() {
			let len = name.chars().count();
			if len < 1 || len > NAME_MAX {
				return Err(TableError::InvalidEntry(*what));
			}
		}
		if self.node_ip.is_unspecified() {
			return Err(TableError::InvalidEntry("node ip"));
		}
		if self.namespace_ip.is_unspecified() {
			return Err(TableError::InvalidEntry("namespace ip"));
		}
		if self.service_ips.is_empty() {
			return Err(TableError::InvalidEntry("service ip list"));
		}
		Ok(())
	}

	/// Whether the entry advertises `ip` under any policy
	pub fn serves(&self, ip: Ipv4Addr) -> bool {
		self.service_ips.iter().any(|s| s.address == ip)
	}

	/// The address pinned to this instance
	pub fn instance_ip(&self) -> Option<Ipv4Addr> {
		self.service_ips
			.iter()
			.find(|s| s.ip_type == ServiceIpType::InstanceNumber)
			.map(|s| s.address)
	}

	/// Fully qualified application name
	pub fn full_name(&self) -> String {
		format!(
			"{}.{}.{}.{}",
			self.app_name, self.app_namespace, self.service_name, self.service_namespace
		)
	}
}

/// Choose the instance a packet to `service_ip` goes to
///
/// An instance pinned to the address wins, otherwise any instance
/// is picked at random
pub fn pick_instance(entries: &[TableEntry], service_ip: Ipv4Addr) -> Option<&TableEntry> {
	let pinned = entries.iter().find(|e| {
		e.service_ips
			.iter()
			.any(|s| s.ip_type == ServiceIpType::InstanceNumber && s.address == service_ip)
	});
	if pinned.is_some() {
		return pinned;
	}
	entries.choose(&mut rand::thread_rng())
}

#[derive(Debug, Default)]
pub struct TranslationTable {
	entries: ShardedLock<Vec<TableEntry>>,
}

impl TranslationTable {
	pub fn new() -> Self {
		Self::default()
	}

	fn read(&self) -> ShardedLockReadGuard<'_, Vec<TableEntry>> {
		match self.entries.read() {
			Ok(entries) => entries,
			// Another thread panicked while holding the lock
			Err(p_err) => p_err.into_inner(),
		}
	}

	fn write(&self) -> ShardedLockWriteGuard<'_, Vec<TableEntry>> {
		match self.entries.write() {
			Ok(entries) => entries,
			Err(p_err) => p_err.into_inner(),
		}
	}

	/// Store a valid entry
	/// At most one entry owns a namespace ip
	pub fn add(&self, entry: TableEntry) -> Result<(), TableError> {
		if let Err(e) = entry.validate() {
			log::warn!("translation table: {} for {}", e, entry.full_name());
			return Err(e);
		}
		let mut entries = self.write();
		if entries.iter().any(|e| e.namespace_ip == entry.namespace_ip) {
			return Err(TableError::InvalidEntry("namespace ip already owned"));
		}
		log::debug!(
			"translation table: add {} instance {} at {}",
			entry.full_name(),
			entry.instance_number,
			entry.namespace_ip
		);
		entries.push(entry);
		Ok(())
	}

	/// Every entry advertising `ip`
	pub fn search_by_service_ip(&self, ip: Ipv4Addr) -> Vec<TableEntry> {
		self.read().iter().filter(|e| e.serves(ip)).cloned().collect()
	}

	pub fn search_by_namespace_ip(&self, ip: Ipv4Addr) -> Option<TableEntry> {
		self.read().iter().find(|e| e.namespace_ip == ip).cloned()
	}

	pub fn remove_by_namespace_ip(&self, ip: Ipv4Addr) -> Result<TableEntry, TableError> {
		let mut entries = self.write();
		let pos = entries
			.iter()
			.position(|e| e.namespace_ip == ip)
			.ok_or(TableError::NotFound(ip))?;
		Ok(entries.remove(pos))
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.read().is_empty()
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	pub(crate) fn entry(app: &str, nsip: Ipv4Addr, sips: Vec<ServiceIp>) -> TableEntry {
		TableEntry {
			app_name: app.to_string(),
			app_namespace: "default".to_string(),
			service_name: "a2".to_string(),
			service_namespace: "default".to_string(),
			instance_number: 0,
			cluster: 0,
			node_ip: Ipv4Addr::new(10, 0, 0, 1),
			node_port: 50011,
			namespace_ip: nsip,
			service_ips: sips,
		}
	}

	fn rr(ip: Ipv4Addr) -> Vec<ServiceIp> {
		vec![ServiceIp::new(ServiceIpType::RoundRobin, ip)]
	}

	#[test]
	fn remove_leaves_other_entries() {
		let table = TranslationTable::new();
		let sip = Ipv4Addr::new(172, 30, 1, 1);
		table
			.add(entry("a1", Ipv4Addr::new(172, 18, 0, 1), rr(sip)))
			.unwrap();
		table
			.add(entry("a3", Ipv4Addr::new(172, 18, 0, 21), rr(sip)))
			.unwrap();

		table
			.remove_by_namespace_ip(Ipv4Addr::new(172, 18, 0, 21))
			.unwrap();
		assert_eq!(table.len(), 1);
		assert_eq!(table.search_by_service_ip(sip)[0].app_name, "a1");
	}

	#[test]
	fn add_then_search_by_namespace_ip() {
		let table = TranslationTable::new();
		let e = entry(
			"app",
			Ipv4Addr::new(172, 18, 0, 7),
			rr(Ipv4Addr::new(172, 30, 0, 7)),
		);
		table.add(e.clone()).unwrap();
		assert_eq!(
			table.search_by_namespace_ip(Ipv4Addr::new(172, 18, 0, 7)),
			Some(e)
		);
		assert!(table
			.search_by_namespace_ip(Ipv4Addr::new(172, 18, 0, 8))
			.is_none());
	}

	#[test]
	fn invalid_entries_are_not_stored() {
		let table = TranslationTable::new();
		let ok = entry(
			"app",
			Ipv4Addr::new(172, 18, 0, 7),
			rr(Ipv4Addr::new(172, 30, 0, 7)),
		);
		table.add(ok.clone()).unwrap();

		let mut bad = Vec::new();
		let mut e = ok.clone();
		e.app_name = String::new();
		bad.push(e);
		let mut e = ok.clone();
		e.service_namespace = "elevenchars".to_string();
		bad.push(e);
		let mut e = ok.clone();
		e.node_ip = Ipv4Addr::UNSPECIFIED;
		bad.push(e);
		let mut e = ok.clone();
		e.namespace_ip = Ipv4Addr::UNSPECIFIED;
		bad.push(e);
		let mut e = ok.clone();
		e.service_ips.clear();
		bad.push(e);
		// same owner twice
		bad.push(ok);

		for e in bad {
			assert!(matches!(table.add(e), Err(TableError::InvalidEntry(_))));
		}
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn service_ip_is_shared_by_instances() {
		let table = TranslationTable::new();
		let sip = Ipv4Addr::new(172, 30, 0, 1);
		for i in 1..4 {
			table
				.add(entry("app", Ipv4Addr::new(172, 18, 0, i), rr(sip)))
				.unwrap();
		}
		assert_eq!(table.search_by_service_ip(sip).len(), 3);
		assert!(table
			.search_by_service_ip(Ipv4Addr::new(172, 30, 0, 2))
			.is_empty());
	}

	#[test]
	fn remove_missing_is_not_found() {
		let table = TranslationTable::new();
		let ip = Ipv4Addr::new(172, 18, 0, 9);
		assert_eq!(
			table.remove_by_namespace_ip(ip),
			Err(TableError::NotFound(ip))
		);
	}

	#[test]
	fn pinned_instance_wins() {
		let sip = Ipv4Addr::new(172, 30, 0, 1);
		let mut entries = Vec::new();
		for i in 1..4u8 {
			let mut e = entry("app", Ipv4Addr::new(172, 18, 0, i), rr(sip));
			e.instance_number = u32::from(i);
			e.service_ips.push(ServiceIp::new(
				ServiceIpType::InstanceNumber,
				Ipv4Addr::new(172, 30, 1, i),
			));
			entries.push(e);
		}
		let pinned = pick_instance(&entries, Ipv4Addr::new(172, 30, 1, 2)).unwrap();
		assert_eq!(pinned.instance_number, 2);

		let any = pick_instance(&entries, sip).unwrap();
		assert!(any.serves(sip));
		assert!(pick_instance(&[], sip).is_none());
	}

	#[test]
	fn service_ip_type_names() {
		assert_eq!(
			"RoundRobin".parse::<ServiceIpType>(),
			Ok(ServiceIpType::RoundRobin)
		);
		assert_eq!(
			"instance_number".parse::<ServiceIpType>(),
			Ok(ServiceIpType::InstanceNumber)
		);
		assert_eq!("1".parse::<ServiceIpType>(), Ok(ServiceIpType::Closest));
		assert!("nearest".parse::<ServiceIpType>().is_err());
	}
}
