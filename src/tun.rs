//! A thin, full-duplex wrapper around a Linux `/dev/net/tun` character
//! device opened in `IFF_TUN | IFF_NO_PI` mode: every read or write is
//! exactly one IPv4 frame, with no link-layer framing in front of it.

use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    if name.len() >= libc::IF_NAMESIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    let mut ifr = unsafe { MaybeUninit::<libc::ifreq>::zeroed().assume_init() };
    for (i, byte) in name.as_bytes().iter().enumerate() {
        ifr.ifr_name[i] = *byte as libc::c_char;
    }
    Ok(ifr)
}

fn ifreq_ioctl(fd: libc::c_int, ifr: &mut libc::ifreq, cmd: libc::c_ulong) -> io::Result<libc::c_int> {
    let res = unsafe { libc::ioctl(fd, cmd as _, ifr as *mut libc::ifreq) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(res)
}

fn control_socket() -> io::Result<File> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_IP);
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(File::from_raw_fd(fd))
    }
}

/// An open tun device, readable and writable from any number of threads:
/// reads are expected to come from a single dedicated reader by convention
/// (see the pipeline module), writes are serialized by an internal mutex
/// held only around the syscall.
pub struct TunDevice {
    fd: RawFd,
    mtu: usize,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

// SAFETY: the raw fd is never aliased without going through a syscall; the
// kernel serializes concurrent read()/write() on the same fd, and writes
// additionally take `write_lock` to keep frames from interleaving.
unsafe impl Send for TunDevice {}
unsafe impl Sync for TunDevice {}

impl TunDevice {
    /// Opens (or creates) the named tun interface and brings it up.
    pub fn open(name: &str) -> io::Result<TunDevice> {
        let fd = unsafe {
            let fd = libc::open(
                "/dev/net/tun\0".as_ptr() as *const libc::c_char,
                libc::O_RDWR,
            );
            if fd == -1 {
                return Err(io::Error::last_os_error());
            }
            fd
        };

        let mut ifr = ifreq_for(name)?;
        unsafe {
            ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;
        }
        if let Err(e) = ifreq_ioctl(fd, &mut ifr, libc::TUNSETIFF) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let ctrl = control_socket()?;
        if let Err(e) = ifreq_ioctl(ctrl.as_raw_fd(), &mut ifr, libc::SIOCGIFFLAGS) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        unsafe {
            ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        }
        if let Err(e) = ifreq_ioctl(ctrl.as_raw_fd(), &mut ifr, libc::SIOCSIFFLAGS) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let mtu = match ifreq_ioctl(ctrl.as_raw_fd(), &mut ifr, libc::SIOCGIFMTU) {
            Ok(_) => unsafe { ifr.ifr_ifru.ifru_mtu as usize },
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        Ok(TunDevice { fd, mtu, write_lock: Mutex::new(()), closed: AtomicBool::new(false) })
    }

    /// Wraps an already-open tun file descriptor (e.g. handed down by a
    /// privileged parent process), skipping interface creation.
    pub fn from_raw_fd(fd: RawFd, mtu: usize) -> TunDevice {
        TunDevice { fd, mtu, write_lock: Mutex::new(()), closed: AtomicBool::new(false) }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Blocking read of exactly one IP frame. By convention only one
    /// thread ever calls this (the pipeline's reader worker).
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Blocking write of exactly one IP frame. Safe to call from several
    /// writer threads; serialized internally so frames never interleave.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let _guard = self.write_lock.lock().unwrap();
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Closes the underlying descriptor. Any blocked `recv`/`send` on
    /// another thread observes an error afterwards, which the pipeline
    /// treats as termination. Idempotent: a second call (or the eventual
    /// `Drop`) is a no-op.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        self.close();
    }
}
