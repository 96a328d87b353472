//! Table query against the cluster control plane
//!
//! `GET http://{manager}/api/job/ip/{ip}/instances` answers with the service
//! owning `ip` and its current instances.

use serde::Deserialize;
use std::{net::Ipv4Addr, time::Duration};

use super::{QueryError, ServiceIp, ServiceIpType, TableEntry};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve a service ip to the instances currently serving it
pub trait TableQuery: Send + Sync {
	fn query(&self, ip: Ipv4Addr) -> Result<Vec<TableEntry>, QueryError>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
	app_name: String,
	#[serde(default)]
	instance_list: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Instance {
	instance_number: u32,
	namespace_ip: String,
	host_ip: String,
	host_port: u16,
	#[serde(default)]
	service_ip: Vec<Sip>,
}

#[derive(Debug, Deserialize)]
struct Sip {
	#[serde(rename = "IpType")]
	ip_type: String,
	#[serde(rename = "Address")]
	address: String,
}

/// Unparseable addresses become unspecified so the table rejects the entry
fn parse_ip(s: &str) -> Ipv4Addr {
	s.trim().parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Turn a control plane answer into table entries
///
/// The app name must split into exactly four parts
/// (app, app namespace, service, service namespace)
pub fn parse_response(body: &str) -> Result<Vec<TableEntry>, QueryError> {
	let resp: QueryResponse = serde_json::from_str(body)
		.map_err(|e| QueryError::MalformedControlResponse(e.to_string()))?;

	let parts: Vec<&str> = resp.app_name.split('.').collect();
	if parts.len() != 4 {
		return Err(QueryError::MalformedControlResponse(format!(
			"app name {:?} has {} components",
			resp.app_name,
			parts.len()
		)));
	}

	let entries = resp
		.instance_list
		.into_iter()
		.map(|inst| {
			let service_ips = inst
				.service_ip
				.iter()
				.filter_map(|sip| {
					let ip_type = sip.ip_type.parse::<ServiceIpType>();
					let address = sip.address.trim().parse::<Ipv4Addr>();
					match (ip_type, address) {
						(Ok(ip_type), Ok(address)) => Some(ServiceIp::new(ip_type, address)),
						_ => {
							log::warn!(
								"table query: skipping service ip {} {}",
								sip.ip_type,
								sip.address
							);
							None
						}
					}
				})
				.collect();
			TableEntry {
				app_name: parts[0].to_string(),
				app_namespace: parts[1].to_string(),
				service_name: parts[2].to_string(),
				service_namespace: parts[3].to_string(),
				instance_number: inst.instance_number,
				cluster: 0,
				node_ip: parse_ip(&inst.host_ip),
				node_port: inst.host_port,
				namespace_ip: parse_ip(&inst.namespace_ip),
				service_ips,
			}
		})
		.collect();
	Ok(entries)
}

/// Table query over HTTP
pub struct HttpTableQuery {
	client: reqwest::blocking::Client,
	base: String,
}

impl HttpTableQuery {
	pub fn new(manager_ip: &str, manager_port: u16) -> Result<Self, QueryError> {
		let client = reqwest::blocking::Client::builder()
			.timeout(QUERY_TIMEOUT)
			.build()?;
		Ok(Self {
			client,
			base: format!("http://{}:{}", manager_ip, manager_port),
		})
	}

	pub fn url(&self, ip: Ipv4Addr) -> String {
		format!("{}/api/job/ip/{}/instances", self.base, ip)
	}
}

impl TableQuery for HttpTableQuery {
	fn query(&self, ip: Ipv4Addr) -> Result<Vec<TableEntry>, QueryError> {
		let url = self.url(ip);
		log::debug!("table query: {}", url);
		let body = self
			.client
			.get(&url)
			.send()?
			.error_for_status()?
			.text()?;
		log::trace!("table query response: {}", body);
		parse_response(&body)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const BODY: &str = r#"{
		"app_name": "shop.prod.cart.default",
		"instance_list": [
			{
				"instance_number": 0,
				"namespace_ip": "10.18.0.2",
				"host_ip": "192.168.1.10",
				"host_port": 50011,
				"service_ip": [
					{"IpType": "RoundRobin", "Address": "172.30.0.1"},
					{"IpType": "InstanceNumber", "Address": "172.30.1.1"}
				]
			},
			{
				"instance_number": 1,
				"namespace_ip": "10.18.0.66",
				"host_ip": "192.168.1.11",
				"host_port": 50011,
				"service_ip": [
					{"IpType": "RoundRobin", "Address": "172.30.0.1"},
					{"IpType": "teleport", "Address": "172.30.2.1"}
				]
			}
		]
	}"#;

	#[test]
	fn parses_instances() {
		let entries = parse_response(BODY).unwrap();
		assert_eq!(entries.len(), 2);

		let first = &entries[0];
		assert_eq!(first.app_name, "shop");
		assert_eq!(first.app_namespace, "prod");
		assert_eq!(first.service_name, "cart");
		assert_eq!(first.service_namespace, "default");
		assert_eq!(first.node_ip, Ipv4Addr::new(192, 168, 1, 10));
		assert_eq!(first.namespace_ip, Ipv4Addr::new(10, 18, 0, 2));
		assert_eq!(first.instance_ip(), Some(Ipv4Addr::new(172, 30, 1, 1)));
		assert!(first.validate().is_ok());

		// the unknown policy is dropped
		assert_eq!(entries[1].service_ips.len(), 1);
		assert_eq!(entries[1].instance_number, 1);
	}

	#[test]
	fn three_part_app_name_is_malformed() {
		let body = BODY.replace("shop.prod.cart.default", "shop.prod.cart");
		assert!(matches!(
			parse_response(&body),
			Err(QueryError::MalformedControlResponse(_))
		));
	}

	#[test]
	fn invalid_json_is_malformed() {
		assert!(matches!(
			parse_response("<html>503</html>"),
			Err(QueryError::MalformedControlResponse(_))
		));
	}

	#[test]
	fn bad_addresses_fail_validation() {
		let body = BODY.replace("10.18.0.2", "10.18.2");
		let entries = parse_response(&body).unwrap();
		assert_eq!(entries[0].namespace_ip, Ipv4Addr::UNSPECIFIED);
		assert!(entries[0].validate().is_err());
	}

	#[test]
	fn query_url() {
		let q = HttpTableQuery::new("10.0.0.1", 10000).unwrap();
		assert_eq!(
			q.url(Ipv4Addr::new(172, 30, 0, 1)),
			"http://10.0.0.1:10000/api/job/ip/172.30.0.1/instances"
		);
	}
}
