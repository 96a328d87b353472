//! UDP sockets towards the other nodes, one per node address and port

use crossbeam::sync::ShardedLock;
use std::{
	collections::HashMap,
	io,
	net::{Ipv4Addr, SocketAddrV4, UdpSocket},
	sync::Arc,
};

/// Where translated packets leave the node
pub trait Tunnel: Send + Sync {
	fn send(&self, ip: Ipv4Addr, port: u16, buf: &[u8]) -> io::Result<usize>;
	/// Forget the connection to a node after a failed send
	fn evict(&self, ip: Ipv4Addr, port: u16);
}

#[derive(Debug, Default)]
pub struct TunnelPool {
	sockets: ShardedLock<HashMap<String, Arc<UdpSocket>>>,
}

fn key(ip: Ipv4Addr, port: u16) -> String {
	format!("{}:{}", ip, port)
}

impl TunnelPool {
	pub fn new() -> Self {
		Self::default()
	}

	fn cached(&self, key: &str) -> Option<Arc<UdpSocket>> {
		match self.sockets.read() {
			Ok(sockets) => sockets.get(key).cloned(),
			Err(p_err) => p_err.into_inner().get(key).cloned(),
		}
	}

	/// The socket for a node, opened on first use
	pub fn socket(&self, ip: Ipv4Addr, port: u16) -> io::Result<Arc<UdpSocket>> {
		let key = key(ip, port);
		if let Some(socket) = self.cached(&key) {
			return Ok(socket);
		}
		let socket = UdpSocket::bind("0.0.0.0:0")?;
		socket.connect(SocketAddrV4::new(ip, port))?;
		let socket = Arc::new(socket);
		log::debug!("opened tunnel socket to {}", key);

		let mut sockets = match self.sockets.write() {
			Ok(sockets) => sockets,
			Err(p_err) => p_err.into_inner(),
		};
		// another worker may have opened one meanwhile
		Ok(sockets.entry(key).or_insert(socket).clone())
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		match self.sockets.read() {
			Ok(sockets) => sockets.len(),
			Err(p_err) => p_err.into_inner().len(),
		}
	}
}

impl Tunnel for TunnelPool {
	fn send(&self, ip: Ipv4Addr, port: u16, buf: &[u8]) -> io::Result<usize> {
		self.socket(ip, port)?.send(buf)
	}

	/// Drop the socket for a node, the next send opens a fresh one
	fn evict(&self, ip: Ipv4Addr, port: u16) {
		let mut sockets = match self.sockets.write() {
			Ok(sockets) => sockets,
			Err(p_err) => p_err.into_inner(),
		};
		if sockets.remove(&key(ip, port)).is_some() {
			log::debug!("closed tunnel socket to {}:{}", ip, port);
		}
	}
}
