//! The network environment of a node
//!
//! The environment owns the translation table. The proxy reads it through
//! the lookup methods below; a lookup by service ip that misses the table
//! asks the control plane and fills the table with the answer.
//!
//! Workloads get their namespace ip from a `Provisioner`. The built-in
//! `SubnetProvisioner` only hands out addresses, creating namespaces,
//! bridges and veth pairs is left to the runtime.

use ipnetwork::Ipv4Network;
use std::{
	collections::{HashMap, VecDeque},
	net::Ipv4Addr,
	sync::{Mutex, MutexGuard},
};

use super::{pick_instance, EnvError, TableEntry, TableError, TableQuery, TranslationTable};

/// Most workloads one node subnetwork serves
pub const MAX_WORKLOADS: u32 = 62;

/// Assigns namespace ips to workloads
pub trait Provisioner: Send + Sync {
	fn attach_workload(&self, id: &str) -> Result<Ipv4Addr, EnvError>;
	/// Returns the address the workload held
	fn detach_workload(&self, id: &str) -> Result<Ipv4Addr, EnvError>;
}

/// Addresses of a node subnetwork
///
/// The first host address belongs to the bridge, workloads start at the
/// second. Released addresses are handed out again before new ones.
#[derive(Debug)]
pub struct AddressPool {
	next: Ipv4Addr,
	generated: u32,
	limit: u32,
	free: VecDeque<Ipv4Addr>,
}

impl AddressPool {
	pub fn new(subnet: Ipv4Network) -> Self {
		let base = u32::from(subnet.network());
		// network, bridge and broadcast are never handed out
		let limit = subnet.size().saturating_sub(3).min(MAX_WORKLOADS);
		Self {
			next: Ipv4Addr::from(base.wrapping_add(2)),
			generated: 0,
			limit,
			free: VecDeque::new(),
		}
	}

	pub fn generate(&mut self) -> Result<Ipv4Addr, EnvError> {
		if let Some(ip) = self.free.pop_front() {
			return Ok(ip);
		}
		if self.generated >= self.limit {
			log::error!("exhausted address space");
			return Err(EnvError::AddressSpaceExhausted);
		}
		let ip = self.next;
		self.generated += 1;
		self.next = Ipv4Addr::from(u32::from(ip).wrapping_add(1));
		Ok(ip)
	}

	pub fn release(&mut self, ip: Ipv4Addr) {
		self.free.push_back(ip);
	}
}

#[derive(Debug)]
struct Leases {
	pool: AddressPool,
	by_workload: HashMap<String, Ipv4Addr>,
}

/// Address-only provisioner over the node subnetwork
#[derive(Debug)]
pub struct SubnetProvisioner {
	subnet: Ipv4Network,
	leases: Mutex<Leases>,
}

impl SubnetProvisioner {
	pub fn new(subnet: Ipv4Network) -> Self {
		Self {
			subnet,
			leases: Mutex::new(Leases {
				pool: AddressPool::new(subnet),
				by_workload: HashMap::new(),
			}),
		}
	}

	pub fn subnet(&self) -> Ipv4Network {
		self.subnet
	}

	fn lock(&self) -> MutexGuard<'_, Leases> {
		match self.leases.lock() {
			Ok(leases) => leases,
			Err(p_err) => p_err.into_inner(),
		}
	}
}

impl Provisioner for SubnetProvisioner {
	fn attach_workload(&self, id: &str) -> Result<Ipv4Addr, EnvError> {
		let mut leases = self.lock();
		if leases.by_workload.contains_key(id) {
			return Err(EnvError::AlreadyDeployed(id.to_string()));
		}
		let ip = leases.pool.generate()?;
		leases.by_workload.insert(id.to_string(), ip);
		Ok(ip)
	}

	fn detach_workload(&self, id: &str) -> Result<Ipv4Addr, EnvError> {
		let mut leases = self.lock();
		let ip = leases
			.by_workload
			.remove(id)
			.ok_or_else(|| EnvError::UnknownWorkload(id.to_string()))?;
		leases.pool.release(ip);
		Ok(ip)
	}
}

pub struct Environment {
	table: TranslationTable,
	query: Box<dyn TableQuery>,
	provisioner: Box<dyn Provisioner>,
}

impl Environment {
	pub fn new(query: Box<dyn TableQuery>, provisioner: Box<dyn Provisioner>) -> Self {
		Self {
			table: TranslationTable::new(),
			query,
			provisioner,
		}
	}

	/// Instances serving `ip`, asking the control plane on a table miss
	///
	/// A failed or malformed query is a miss and leaves the table as it was
	pub fn entries_by_service_ip(&self, ip: Ipv4Addr) -> Vec<TableEntry> {
		let entries = self.table.search_by_service_ip(ip);
		if !entries.is_empty() {
			return entries;
		}

		match self.query.query(ip) {
			Ok(fresh) => {
				for entry in fresh {
					if let Err(e) = self.add_table_entry(entry) {
						log::warn!("skipping queried entry for {}: {}", ip, e);
					}
				}
				self.table.search_by_service_ip(ip)
			}
			Err(e) => {
				log::warn!("table query for {} failed: {}", ip, e);
				Vec::new()
			}
		}
	}

	pub fn entry_by_namespace_ip(&self, ip: Ipv4Addr) -> Option<TableEntry> {
		self.table.search_by_namespace_ip(ip)
	}

	/// The instance answering to `ip`, the pinned one first
	/// The table is not filled from the control plane
	pub fn entry_by_instance_ip(&self, ip: Ipv4Addr) -> Option<TableEntry> {
		let entries = self.table.search_by_service_ip(ip);
		entries
			.iter()
			.find(|e| e.instance_ip() == Some(ip))
			.or_else(|| entries.first())
			.cloned()
	}

	/// Select the instance a packet to `ip` goes to
	pub fn resolve_service_ip(&self, ip: Ipv4Addr) -> Option<TableEntry> {
		let entries = self.entries_by_service_ip(ip);
		pick_instance(&entries, ip).cloned()
	}

	/// Store an entry, replacing the one owning the same namespace ip
	pub fn add_table_entry(&self, entry: TableEntry) -> Result<(), EnvError> {
		entry.validate()?;
		match self.table.remove_by_namespace_ip(entry.namespace_ip) {
			Ok(old) => log::debug!("replacing table entry for {}", old.namespace_ip),
			Err(TableError::NotFound(_)) => {}
			Err(e) => return Err(e.into()),
		}
		self.table.add(entry)?;
		Ok(())
	}

	pub fn table_len(&self) -> usize {
		self.table.len()
	}

	/// Attach a workload, returning its namespace ip
	pub fn deploy(&self, id: &str) -> Result<Ipv4Addr, EnvError> {
		let ip = self.provisioner.attach_workload(id)?;
		log::info!("deployed {} at {}", id, ip);
		Ok(ip)
	}

	/// Detach a workload and withdraw its table entry
	pub fn undeploy(&self, id: &str) -> Result<Ipv4Addr, EnvError> {
		let ip = self.provisioner.detach_workload(id)?;
		if self.table.remove_by_namespace_ip(ip).is_err() {
			log::debug!("no table entry owned {}", ip);
		}
		log::info!("undeployed {} from {}", id, ip);
		Ok(ip)
	}
}
