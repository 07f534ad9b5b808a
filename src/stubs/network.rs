//! Socket stubs. No real sockets are created; peers handed to `connect` and
//! `sendto` are captured so exfiltration endpoints show up in the run output.

pub mod dns;

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, return_from_stub};

/// A network endpoint observed during emulation.
#[derive(Clone, Debug)]
pub struct CapturedHost {
    pub ip: String,
    pub port: u16,
    /// Hostname when a resolver call supplied one.
    pub hostname: String,
    /// Which stub saw it: "connect", "getaddrinfo", ...
    pub source: String,
}

struct NetState {
    next_fd: u64,
    sockets: HashSet<u64>,
}

static STATE: Lazy<Mutex<NetState>> = Lazy::new(|| {
    Mutex::new(NetState {
        next_fd: 100,
        sockets: HashSet::new(),
    })
});

static CAPTURED_HOSTS: Lazy<Mutex<Vec<CapturedHost>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn captured_hosts() -> Vec<CapturedHost> {
    CAPTURED_HOSTS.lock().unwrap().clone()
}

pub fn clear_captured_hosts() {
    CAPTURED_HOSTS.lock().unwrap().clear();
}

pub(crate) fn capture_host(ip: &str, port: u16, hostname: &str, source: &str) {
    CAPTURED_HOSTS.lock().unwrap().push(CapturedHost {
        ip: ip.to_string(),
        port,
        hostname: hostname.to_string(),
        source: source.to_string(),
    });
}

/// Reads a `sockaddr_in`: family, big-endian port, dotted-quad address.
pub(crate) fn parse_sockaddr_in(emu: &Emulator, addr: u64) -> Option<(String, u16)> {
    if addr == 0 {
        return None;
    }
    let data = emu.mem_read(addr, 8).ok()?;
    let family = u16::from_le_bytes([data[0], data[1]]);
    if family != 2 {
        return None; // AF_INET only
    }
    let port = u16::from_be_bytes([data[2], data[3]]);
    let ip = format!("{}.{}.{}.{}", data[4], data[5], data[6], data[7]);
    Some((ip, port))
}

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;

    r.register_func("network", "socket", stub_socket);
    r.register_func("network", "connect", stub_connect);
    r.register_func("network", "bind", stub_ret0);
    r.register_func("network", "listen", stub_ret0);
    r.register_func("network", "accept", stub_retneg1);
    r.register_func("network", "send", stub_send);
    r.register_func("network", "recv", stub_ret0);
    r.register_func("network", "sendto", stub_sendto);
    r.register_func("network", "recvfrom", stub_ret0);
    r.register_func("network", "shutdown", stub_ret0);
    r.register_func("network", "setsockopt", stub_ret0);
    r.register_func("network", "getsockopt", stub_ret0);
    r.register_func("network", "ioctl", stub_ret0);
    r.register_func("network", "select", stub_ret0);
    r.register_func("network", "poll", stub_ret0);
    r.register(crate::stubs::StubDef {
        name: "epoll_create",
        aliases: &["epoll_create1"],
        hook: stub_epoll_create,
        category: "network",
    });
    r.register_func("network", "epoll_ctl", stub_ret0);
    r.register_func("network", "epoll_wait", stub_ret0);

    dns::register();
}

fn stub_ret0(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_retneg1(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, u64::MAX);
    return_from_stub(emu);
    false
}

fn stub_socket(emu: &mut Emulator) -> bool {
    let fd = {
        let mut state = STATE.lock().unwrap();
        let fd = state.next_fd;
        state.next_fd += 1;
        state.sockets.insert(fd);
        fd
    };
    stubs::log_call(emu, "network", "socket", &stubs::format_ptr("fd", fd));
    let _ = emu.set_x(0, fd);
    return_from_stub(emu);
    false
}

fn stub_connect(emu: &mut Emulator) -> bool {
    let addr = emu.x(1);
    if let Some((ip, port)) = parse_sockaddr_in(emu, addr) {
        stubs::log_call(emu, "network", "connect", &format!("{ip}:{port}"));
        capture_host(&ip, port, "", "connect");
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_send(emu: &mut Emulator) -> bool {
    // Claim the whole buffer was sent.
    let len = emu.x(2);
    let _ = emu.set_x(0, len);
    return_from_stub(emu);
    false
}

fn stub_sendto(emu: &mut Emulator) -> bool {
    let len = emu.x(2);
    let addr = emu.x(4);
    if let Some((ip, port)) = parse_sockaddr_in(emu, addr) {
        stubs::log_call(emu, "network", "sendto", &format!("{ip}:{port}"));
        capture_host(&ip, port, "", "sendto");
    }
    let _ = emu.set_x(0, len);
    return_from_stub(emu);
    false
}

fn stub_epoll_create(emu: &mut Emulator) -> bool {
    let fd = {
        let mut state = STATE.lock().unwrap();
        let fd = state.next_fd;
        state.next_fd += 1;
        fd
    };
    let _ = emu.set_x(0, fd);
    return_from_stub(emu);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_captures_peer() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();

        let sockaddr = emu.malloc(16);
        emu.mem_write_u16(sockaddr, 2).unwrap(); // AF_INET
        emu.mem_write_u16(sockaddr + 2, 0x5000).unwrap(); // port 80, big endian
        emu.mem_write(sockaddr + 4, &[10, 0, 0, 7]).unwrap();

        emu.set_x(0, 100).unwrap();
        emu.set_x(1, sockaddr).unwrap();
        stub_connect(&mut emu);

        // The captured list is process-wide; look for this test's entry.
        let hosts = captured_hosts();
        assert!(hosts
            .iter()
            .any(|h| h.ip == "10.0.0.7" && h.port == 80 && h.source == "connect"));
    }

    #[test]
    fn non_inet_sockaddr_is_ignored() {
        let mut emu = Emulator::new().unwrap();
        let sockaddr = emu.malloc(16);
        emu.mem_write_u16(sockaddr, 10).unwrap(); // AF_INET6
        assert!(parse_sockaddr_in(&emu, sockaddr).is_none());
        assert!(parse_sockaddr_in(&emu, 0).is_none());
    }
}
