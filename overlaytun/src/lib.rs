//! The virtual network interface of the overlay
//!
//! A `Device` moves raw IP packets between the kernel and the proxy.
//! `TunDevice` is the Linux implementation: a TUN interface opened through
//! `/dev/net/tun` without packet information headers, configured with
//! the `ip` tool.

use std::{
    ffi::OsStr,
    fs, io,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd},
    process::Command,
    time::Duration,
};

use ipnetwork::Ipv4Network;
use thiserror::Error;

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

pub const DEFAULT_MTU: u16 = 1492;

#[derive(Error, Debug)]
pub enum TunError {
    #[error("interface name {0:?} is empty or longer than 15 bytes")]
    InvalidName(String),
    #[error("failed to open /dev/net/tun: {0}")]
    Open(io::Error),
    #[error("TUNSETIFF failed: {0}")]
    Ioctl(io::Error),
    #[error("`{cmd}` failed: {reason}")]
    Command { cmd: String, reason: String },
}

/// Blocking packet device
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Read one packet
    /// Fails with `TimedOut` when nothing arrives within `timeout`
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write one packet
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

#[derive(Debug, Clone)]
pub struct TunConfig {
    pub name: String,
    /// Address and prefix assigned to the interface
    pub address: Ipv4Network,
    pub mtu: u16,
    /// Extra destinations routed into the interface
    pub routes: Vec<Ipv4Network>,
}

impl TunConfig {
    pub fn new(name: &str, address: Ipv4Network) -> Self {
        Self {
            name: name.to_string(),
            address,
            mtu: DEFAULT_MTU,
            routes: Vec::new(),
        }
    }

    /// `ip` invocations bringing the interface up
    pub fn setup_commands(&self) -> Vec<Vec<String>> {
        let mut cmds = vec![
            vec![
                "addr".to_string(),
                "add".to_string(),
                self.address.to_string(),
                "dev".to_string(),
                self.name.clone(),
            ],
            vec![
                "link".to_string(),
                "set".to_string(),
                "dev".to_string(),
                self.name.clone(),
                "mtu".to_string(),
                self.mtu.to_string(),
            ],
            vec![
                "link".to_string(),
                "set".to_string(),
                "dev".to_string(),
                self.name.clone(),
                "up".to_string(),
            ],
        ];
        for route in self.routes.iter() {
            cmds.push(vec![
                "route".to_string(),
                "add".to_string(),
                route.to_string(),
                "dev".to_string(),
                self.name.clone(),
            ]);
        }
        cmds
    }
}

#[repr(C)]
struct Ifreq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

impl Ifreq {
    fn tun(name: &str) -> Result<Self, TunError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
            return Err(TunError::InvalidName(name.to_string()));
        }
        let mut ifr = Ifreq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _padding: [0; 22],
        };
        for (i, &b) in bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        Ok(ifr)
    }

    fn name(&self) -> String {
        let len = self
            .ifr_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(libc::IFNAMSIZ);
        let bytes: Vec<u8> = self.ifr_name[..len].iter().map(|&c| c as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn ip<S: AsRef<OsStr>>(args: &[S]) -> Result<(), TunError> {
    let cmd = format!(
        "ip {}",
        args.iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    );
    log::debug!("{}", cmd);
    let out = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| TunError::Command {
            cmd: cmd.clone(),
            reason: e.to_string(),
        })?;
    if !out.status.success() {
        return Err(TunError::Command {
            cmd,
            reason: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Linux TUN interface
/// The interface goes away when the device is dropped
pub struct TunDevice {
    fd: OwnedFd,
    name: String,
}

impl TunDevice {
    /// Create the interface and configure it
    /// Routes that cannot be added and the reverse path filter are not fatal
    pub fn create(config: &TunConfig) -> Result<Self, TunError> {
        let ifr = Ifreq::tun(&config.name)?;
        let fd = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr().cast::<libc::c_char>(),
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(TunError::Open(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) };
        if ret < 0 {
            return Err(TunError::Ioctl(io::Error::last_os_error()));
        }
        let dev = Self {
            fd,
            name: ifr.name(),
        };
        log::info!("created tun device {}", dev.name);

        let config = TunConfig {
            name: dev.name.clone(),
            ..config.clone()
        };
        let cmds = config.setup_commands();
        let (link, routes) = cmds.split_at(3);
        for cmd in link {
            ip(&cmd[..])?;
        }
        for cmd in routes {
            if let Err(e) = ip(&cmd[..]) {
                log::warn!("{}", e);
            }
        }

        let rp_filter = format!("/proc/sys/net/ipv4/conf/{}/rp_filter", dev.name);
        if let Err(e) = fs::write(&rp_filter, "0") {
            log::warn!("could not disable reverse path filtering on {}: {}", dev.name, e);
        }
        log::info!(
            "tun device {} up with {} mtu {}",
            dev.name,
            config.address,
            config.mtu
        );
        Ok(dev)
    }
}

impl Device for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret == 0 {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr().cast::<libc::c_void>(),
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_name_round_trip() {
        let ifr = Ifreq::tun("goProxyTun").unwrap();
        assert_eq!(ifr.name(), "goProxyTun");
        assert_eq!(ifr.ifr_flags, IFF_TUN | IFF_NO_PI);
    }

    #[test]
    fn ifreq_rejects_bad_names() {
        assert!(matches!(Ifreq::tun(""), Err(TunError::InvalidName(_))));
        assert!(matches!(
            Ifreq::tun("averyveryverylongname"),
            Err(TunError::InvalidName(_))
        ));
    }

    #[test]
    fn setup_commands() {
        let mut config = TunConfig::new("tun7", "172.19.1.254/16".parse().unwrap());
        config.routes.push("172.30.0.0/16".parse().unwrap());
        let cmds = config.setup_commands();
        assert_eq!(cmds.len(), 4);
        assert_eq!(cmds[0].join(" "), "addr add 172.19.1.254/16 dev tun7");
        assert_eq!(cmds[1].join(" "), "link set dev tun7 mtu 1492");
        assert_eq!(cmds[2].join(" "), "link set dev tun7 up");
        assert_eq!(cmds[3].join(" "), "route add 172.30.0.0/16 dev tun7");
    }
}
