//! Packet capture and dispatch
//!
//! Two read loops, one on the TUN device and one on the tunnel socket,
//! decode what they read and queue TCP and UDP packets for a pool of workers.
//! Everything else is dropped.
//!
//! The loops coordinate with the control thread over channels:
//! 	stop		- sent once per loop, observed within one read timeout
//! 	errors		- read errors, the loop keeps reading after them
//! 	finished	- each loop reports here before it exits

use crossbeam::{
	channel::{bounded, Receiver, Sender, TryRecvError},
	select,
};
use overlaylib::Packet;
use overlaytun::Device;
use std::{
	fmt, io,
	net::UdpSocket,
	sync::Arc,
	thread::{self, JoinHandle},
	time::Duration,
};
use thiserror::Error;

use super::OverlayProxy;

pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(200);
const QUEUE_LEN: usize = 1024;
const ERROR_QUEUE_LEN: usize = 64;
const BUF_LEN: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
	Interface,
	Tunnel,
}

impl fmt::Display for Task {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Task::Interface => write!(f, "interface listener"),
			Task::Tunnel => write!(f, "tunnel listener"),
		}
	}
}

#[derive(Error, Debug)]
pub(crate) enum CaptureError {
	#[error("interface read failed: {0}")]
	Interface(io::Error),
	#[error("tunnel read failed: {0}")]
	Tunnel(io::Error),
}

fn is_timeout(e: &io::Error) -> bool {
	matches!(
		e.kind(),
		io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
	)
}

fn should_stop(stop: &Receiver<()>) -> bool {
	!matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

/// Decode and queue one frame
/// Returns false once nobody consumes the queue
fn dispatch(task: Task, bytes: &[u8], data: &Sender<Packet>) -> bool {
	match Packet::decode(bytes) {
		Ok(Packet::Other) => {
			log::trace!("{}: dropping non TCP/UDP packet", task);
			true
		}
		Ok(packet) => data.send(packet).is_ok(),
		Err(e) => {
			log::debug!("{}: dropping undecodable packet: {}", task, e);
			true
		}
	}
}

pub(crate) fn interface_listen(
	device: Arc<dyn Device>,
	data: Sender<Packet>,
	errors: Sender<CaptureError>,
	stop: Receiver<()>,
	finished: Sender<Task>,
) {
	let task = Task::Interface;
	let mut buf = vec![0u8; BUF_LEN];
	log::info!("{} started on {}", task, device.name());
	while !should_stop(&stop) {
		match device.recv(&mut buf, READ_TIMEOUT) {
			Ok(n) => {
				if !dispatch(task, &buf[..n], &data) {
					break;
				}
			}
			Err(e) if is_timeout(&e) => {}
			Err(e) => {
				let _ = errors.try_send(CaptureError::Interface(e));
			}
		}
	}
	log::info!("{} stopped", task);
	let _ = finished.send(task);
}

pub(crate) fn tunnel_listen(
	socket: UdpSocket,
	data: Sender<Packet>,
	errors: Sender<CaptureError>,
	stop: Receiver<()>,
	finished: Sender<Task>,
) {
	let task = Task::Tunnel;
	let mut buf = vec![0u8; BUF_LEN];
	if let Err(e) = socket.set_read_timeout(Some(READ_TIMEOUT)) {
		log::error!("{}: cannot set read timeout: {}", task, e);
	}
	match socket.local_addr() {
		Ok(addr) => log::info!("{} started on {}", task, addr),
		Err(_) => log::info!("{} started", task),
	}
	while !should_stop(&stop) {
		match socket.recv_from(&mut buf) {
			Ok((n, from)) => {
				log::trace!("{}: {} bytes from {}", task, n, from);
				if !dispatch(task, &buf[..n], &data) {
					break;
				}
			}
			Err(e) if is_timeout(&e) => {}
			Err(e) => {
				let _ = errors.try_send(CaptureError::Tunnel(e));
			}
		}
	}
	drop(socket);
	log::info!("{} stopped", task);
	let _ = finished.send(task);
}

/// Translate and forward queued packets until both listeners are gone
fn worker(proxy: Arc<OverlayProxy>, outgoing: Receiver<Packet>, ingoing: Receiver<Packet>) {
	loop {
		select! {
			recv(outgoing) -> msg => match msg {
				Ok(packet) => proxy.outgoing_message(&packet),
				Err(_) => break,
			},
			recv(ingoing) -> msg => match msg {
				Ok(packet) => proxy.ingoing_message(&packet),
				Err(_) => break,
			},
		}
	}
}

/// Running listeners and workers
pub(crate) struct ListenHandle {
	stop: Vec<Sender<()>>,
	finished: Receiver<Task>,
	errors: Receiver<CaptureError>,
	threads: Vec<JoinHandle<()>>,
}

impl ListenHandle {
	/// Read errors of both listeners
	pub(crate) fn errors(&self) -> &Receiver<CaptureError> {
		&self.errors
	}

	/// Stop both listeners and wait for them and the workers
	pub(crate) fn shutdown(self) {
		for stop in self.stop.iter() {
			let _ = stop.send(());
		}
		for _ in 0..self.stop.len() {
			match self.finished.recv() {
				Ok(task) => log::info!("{} finished", task),
				Err(_) => break,
			}
		}
		for thread in self.threads {
			if thread.join().is_err() {
				log::error!("a proxy thread panicked");
			}
		}
	}
}

/// Start capturing on the proxy device and the tunnel socket
pub(crate) fn listen(
	proxy: Arc<OverlayProxy>,
	socket: UdpSocket,
	workers: usize,
) -> io::Result<ListenHandle> {
	let (out_tx, out_rx) = bounded(QUEUE_LEN);
	let (in_tx, in_rx) = bounded(QUEUE_LEN);
	let (err_tx, err_rx) = bounded(ERROR_QUEUE_LEN);
	let (done_tx, done_rx) = bounded(2);
	let (stop_if_tx, stop_if_rx) = bounded(1);
	let (stop_tun_tx, stop_tun_rx) = bounded(1);

	let mut threads = Vec::with_capacity(workers + 2);
	let device = Arc::clone(proxy.device());
	{
		let errors = err_tx.clone();
		let finished = done_tx.clone();
		threads.push(
			thread::Builder::new()
				.name("interface".to_string())
				.spawn(move || interface_listen(device, out_tx, errors, stop_if_rx, finished))?,
		);
	}
	threads.push(
		thread::Builder::new()
			.name("tunnel".to_string())
			.spawn(move || tunnel_listen(socket, in_tx, err_tx, stop_tun_rx, done_tx))?,
	);
	for i in 0..workers.max(1) {
		let proxy = Arc::clone(&proxy);
		let outgoing = out_rx.clone();
		let ingoing = in_rx.clone();
		threads.push(
			thread::Builder::new()
				.name(format!("worker-{}", i))
				.spawn(move || worker(proxy, outgoing, ingoing))?,
		);
	}
	log::info!("proxy listening with {} workers", workers.max(1));

	Ok(ListenHandle {
		stop: vec![stop_if_tx, stop_tun_tx],
		finished: done_rx,
		errors: err_rx,
		threads,
	})
}
