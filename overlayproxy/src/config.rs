//! Proxy configuration
//!
//! Values come from the command line (or the environment), then the
//! optional JSON file, then the defaults below.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ipnetwork::Ipv4Network;
use overlaytun::{TunConfig, DEFAULT_MTU};
use serde::Deserialize;
use std::{
	fs,
	net::{Ipv4Addr, UdpSocket},
	path::{Path, PathBuf},
};

const DEFAULT_TUN_NAME: &str = "goProxyTun";
const DEFAULT_TUN_ADDR: &str = "172.19.1.254/16";
const DEFAULT_PROXY_SUBNETWORK: &str = "172.30.0.0/16";
const DEFAULT_NODE_SUBNETWORK: &str = "172.19.1.0/26";
const DEFAULT_TUNNEL_PORT: u16 = 50011;
const DEFAULT_MANAGER_IP: &str = "127.0.0.1";
const DEFAULT_MANAGER_PORT: u16 = 10000;
const DEFAULT_PROXY_CACHE: usize = 10;
const DEFAULT_HOST_CACHE: usize = 20;
const DEFAULT_WORKERS: usize = 4;

#[derive(Parser, Debug, Clone, Default)]
#[command(version, about = "Overlay network proxy", long_about = None)]
pub struct Args {
	/// JSON configuration file
	#[arg(long, env = "OVERLAY_CONFIG")]
	pub config: Option<PathBuf>,

	/// Name of the TUN device
	#[arg(long)]
	pub tun_name: Option<String>,

	/// Address assigned to the TUN device, in CIDR notation
	#[arg(long)]
	pub tun_addr: Option<Ipv4Network>,

	#[arg(long)]
	pub mtu: Option<u16>,

	/// Range of the service ips
	#[arg(long)]
	pub proxy_subnetwork: Option<Ipv4Network>,

	/// UDP port of the tunnel
	#[arg(long)]
	pub tunnel_port: Option<u16>,

	/// Address of this node, detected when absent
	#[arg(long)]
	pub local_ip: Option<Ipv4Addr>,

	#[arg(long, env = "CLUSTER_MANAGER_IP")]
	pub cluster_manager_ip: Option<String>,

	#[arg(long, env = "CLUSTER_MANAGER_PORT")]
	pub cluster_manager_port: Option<u16>,

	/// Range the workload namespace ips are taken from
	#[arg(long)]
	pub node_subnetwork: Option<Ipv4Network>,

	/// Sessions remembered per source ip
	#[arg(long)]
	pub proxy_cache_size: Option<usize>,

	#[arg(long)]
	pub host_cache_size: Option<usize>,

	/// Threads translating and forwarding packets
	#[arg(long)]
	pub workers: Option<usize>,
}

/// The configuration file
///
/// `ProxySubnetwork` is either a CIDR or, with `ProxySubnetworkMask`,
/// a network address and a dotted mask
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileConfig {
	#[serde(rename = "HostTUNDeviceName")]
	pub host_tun_device_name: Option<String>,
	pub proxy_subnetwork: Option<String>,
	pub proxy_subnetwork_mask: Option<String>,
	#[serde(rename = "TunNetIP")]
	pub tun_net_ip: Option<String>,
	pub tunnel_port: Option<u16>,
	#[serde(rename = "MTU")]
	pub mtu: Option<u16>,
	#[serde(rename = "LocalIP")]
	pub local_ip: Option<String>,
	#[serde(rename = "ClusterManagerIP")]
	pub cluster_manager_ip: Option<String>,
	pub cluster_manager_port: Option<u16>,
	pub node_subnetwork: Option<String>,
	pub proxy_cache_size: Option<usize>,
	pub host_cache_size: Option<usize>,
	pub workers: Option<usize>,
}

impl FileConfig {
	pub fn read(path: &Path) -> Result<Self> {
		let raw = fs::read_to_string(path)
			.with_context(|| format!("reading {}", path.display()))?;
		let config = serde_json::from_str(&raw)
			.with_context(|| format!("parsing {}", path.display()))?;
		Ok(config)
	}

	fn proxy_subnetwork(&self) -> Result<Option<Ipv4Network>> {
		let net = match &self.proxy_subnetwork {
			Some(net) => net,
			None => return Ok(None),
		};
		let parsed = match &self.proxy_subnetwork_mask {
			Some(mask) => {
				let ip: Ipv4Addr = net.parse().context("ProxySubnetwork")?;
				let mask: Ipv4Addr = mask.parse().context("ProxySubnetworkMask")?;
				Ipv4Network::with_netmask(ip, mask).context("ProxySubnetworkMask")?
			}
			None => net.parse().context("ProxySubnetwork")?,
		};
		Ok(Some(parsed))
	}
}

fn parse_opt<T>(value: &Option<String>, what: &str) -> Result<Option<T>>
where
	T: std::str::FromStr,
	T::Err: std::error::Error + Send + Sync + 'static,
{
	match value {
		Some(v) => Ok(Some(v.parse().with_context(|| format!("{} {:?}", what, v))?)),
		None => Ok(None),
	}
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
	pub tun: TunConfig,
	pub proxy_subnetwork: Ipv4Network,
	pub tunnel_port: u16,
	pub local_ip: Ipv4Addr,
	pub cluster_manager_ip: String,
	pub cluster_manager_port: u16,
	pub node_subnetwork: Ipv4Network,
	pub proxy_cache_size: usize,
	pub host_cache_size: usize,
	pub workers: usize,
}

impl ProxyConfig {
	pub fn load(args: &Args) -> Result<Self> {
		let file = match &args.config {
			Some(path) => FileConfig::read(path)?,
			None => FileConfig::default(),
		};
		Self::merge(args, &file)
	}

	fn merge(args: &Args, file: &FileConfig) -> Result<Self> {
		let name = args
			.tun_name
			.clone()
			.or_else(|| file.host_tun_device_name.clone())
			.unwrap_or_else(|| DEFAULT_TUN_NAME.to_string());
		let address = match args.tun_addr {
			Some(addr) => addr,
			None => match parse_opt(&file.tun_net_ip, "TunNetIP")? {
				Some(addr) => addr,
				None => DEFAULT_TUN_ADDR.parse()?,
			},
		};
		let proxy_subnetwork = match args.proxy_subnetwork {
			Some(net) => net,
			None => match file.proxy_subnetwork()? {
				Some(net) => net,
				None => DEFAULT_PROXY_SUBNETWORK.parse()?,
			},
		};
		let node_subnetwork = match args.node_subnetwork {
			Some(net) => net,
			None => match parse_opt(&file.node_subnetwork, "NodeSubnetwork")? {
				Some(net) => net,
				None => DEFAULT_NODE_SUBNETWORK.parse()?,
			},
		};
		let local_ip = match args.local_ip {
			Some(ip) => ip,
			None => match parse_opt(&file.local_ip, "LocalIP")? {
				Some(ip) => ip,
				None => detect_local_ip()?,
			},
		};

		let mut tun = TunConfig::new(&name, address);
		tun.mtu = args.mtu.or(file.mtu).unwrap_or(DEFAULT_MTU);
		if !address.contains(proxy_subnetwork.network()) {
			tun.routes.push(proxy_subnetwork);
		}

		let config = Self {
			tun,
			proxy_subnetwork,
			tunnel_port: args
				.tunnel_port
				.or(file.tunnel_port)
				.unwrap_or(DEFAULT_TUNNEL_PORT),
			local_ip,
			cluster_manager_ip: args
				.cluster_manager_ip
				.clone()
				.or_else(|| file.cluster_manager_ip.clone())
				.unwrap_or_else(|| DEFAULT_MANAGER_IP.to_string()),
			cluster_manager_port: args
				.cluster_manager_port
				.or(file.cluster_manager_port)
				.unwrap_or(DEFAULT_MANAGER_PORT),
			node_subnetwork,
			proxy_cache_size: args
				.proxy_cache_size
				.or(file.proxy_cache_size)
				.unwrap_or(DEFAULT_PROXY_CACHE),
			host_cache_size: args
				.host_cache_size
				.or(file.host_cache_size)
				.unwrap_or(DEFAULT_HOST_CACHE),
			workers: args.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS),
		};
		if config.workers == 0 {
			bail!("at least one worker is needed");
		}
		Ok(config)
	}
}

/// Source address the kernel picks for outbound traffic
/// Connecting a UDP socket sends nothing
pub fn detect_local_ip() -> Result<Ipv4Addr> {
	let socket = UdpSocket::bind("0.0.0.0:0").context("binding probe socket")?;
	socket
		.connect("8.8.8.8:80")
		.context("no route to detect the local ip, set --local-ip")?;
	match socket.local_addr()?.ip() {
		std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
		other => bail!("detected unusable local ip {}", other),
	}
}
