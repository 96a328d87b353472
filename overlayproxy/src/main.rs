mod config;
mod proxy;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, ProxyConfig};
use crossbeam::{
	channel::{bounded, Sender},
	select,
};
use overlaylib::{Environment, HttpTableQuery, SubnetProvisioner};
use overlaytun::TunDevice;
use proxy::*;

use std::{net::UdpSocket, sync::Arc};

/// Handle Ctrl+C
fn handle_signal(stop: Sender<()>) -> Result<()> {
	ctrlc::set_handler(move || {
		let _ = stop.try_send(());
	})
	.context("Error setting Ctrl-C handler")
}

fn main() -> Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
	let args = Args::parse();
	let config = ProxyConfig::load(&args)?;
	#[cfg(feature = "debug")]
	println!("config: {:#?}", config);

	// the proxy cannot run without its device and socket
	let device = TunDevice::create(&config.tun).context("creating the tun device")?;
	let socket = UdpSocket::bind(("0.0.0.0", config.tunnel_port))
		.with_context(|| format!("binding tunnel port {}", config.tunnel_port))?;
	log::info!("tunnel bound on port {}", config.tunnel_port);

	let query = HttpTableQuery::new(&config.cluster_manager_ip, config.cluster_manager_port)
		.context("creating the table query client")?;
	let provisioner = SubnetProvisioner::new(config.node_subnetwork);
	let env = Environment::new(Box::new(query), Box::new(provisioner));
	let settings = ProxySettings {
		subnetwork: config.proxy_subnetwork,
		local_ip: config.local_ip,
		proxy_cache_size: config.proxy_cache_size,
		host_cache_size: config.host_cache_size,
	};
	log::info!(
		"proxying {} on node {} via {}",
		settings.subnetwork,
		settings.local_ip,
		config.tun.name
	);
	let proxy = Arc::new(OverlayProxy::new(Arc::new(device), env, settings));

	let handle = listen(proxy, socket, config.workers).context("starting the listeners")?;
	#[cfg(feature = "debug")]
	println!("listeners started");

	// handling Ctrl+C
	let (stop_tx, stop_rx) = bounded(1);
	handle_signal(stop_tx)?;
	#[cfg(feature = "debug")]
	println!("main loop starting");
	loop {
		select! {
			recv(stop_rx) -> _ => break,
			recv(handle.errors()) -> err => match err {
				Ok(e) => log::error!("{}", e),
				Err(_) => break,
			},
		}
	}

	log::info!("shutting down");
	handle.shutdown();
	Ok(())
}
