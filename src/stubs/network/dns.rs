//! Resolver stubs. Hostnames are captured; every lookup "succeeds" with
//! 127.0.0.1 so connection code keeps moving without touching a network.

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, return_from_stub};

use super::capture_host;

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;
    r.register_func("network", "getaddrinfo", stub_getaddrinfo);
    r.register_func("network", "freeaddrinfo", stub_void);
    r.register_func("network", "getnameinfo", stub_ret1);
    r.register(crate::stubs::StubDef {
        name: "gethostbyname",
        aliases: &["gethostbyname2"],
        hook: stub_gethostbyname,
        category: "network",
    });
    r.register_func("network", "gethostbyaddr", stub_ret0);
    r.register_func("network", "getpeername", stub_getpeername);
    r.register_func("network", "getsockname", stub_getpeername);
    r.register_func("network", "inet_aton", stub_inet_aton);
    r.register_func("network", "inet_ntoa", stub_inet_ntoa);
    r.register_func("network", "inet_pton", stub_inet_pton);
    r.register_func("network", "inet_ntop", stub_inet_ntop);
    r.register_func("network", "htons", stub_swap16);
    r.register_func("network", "ntohs", stub_swap16);
    r.register_func("network", "htonl", stub_swap32);
    r.register_func("network", "ntohl", stub_swap32);
}

fn stub_void(emu: &mut Emulator) -> bool {
    return_from_stub(emu);
    false
}

fn stub_ret0(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_ret1(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 1);
    return_from_stub(emu);
    false
}

fn stub_getaddrinfo(emu: &mut Emulator) -> bool {
    let node = emu.x(0);
    let service = emu.x(1);
    let res = emu.x(3);

    let hostname = if node != 0 {
        emu.mem_read_string(node, 256).unwrap_or_default()
    } else {
        String::new()
    };
    let service_str = if service != 0 {
        emu.mem_read_string(service, 32).unwrap_or_default()
    } else {
        String::new()
    };

    if !hostname.is_empty() {
        let port: u16 = service_str.parse().unwrap_or(0);
        capture_host("127.0.0.1", port, &hostname, "getaddrinfo");
        stubs::log_call(
            emu,
            "network",
            "getaddrinfo",
            &format!("host={hostname} service={service_str}"),
        );
    }

    // struct addrinfo { flags, family, socktype, protocol, addrlen, pad,
    //                   *ai_addr, *ai_canonname, *ai_next }
    let addrinfo = emu.malloc(64);
    let sockaddr = emu.malloc(32);

    let _ = emu.mem_write_u32(addrinfo, 0);
    let _ = emu.mem_write_u32(addrinfo + 4, 2); // AF_INET
    let _ = emu.mem_write_u32(addrinfo + 8, 1); // SOCK_STREAM
    let _ = emu.mem_write_u32(addrinfo + 12, 0);
    let _ = emu.mem_write_u32(addrinfo + 16, 16);
    let _ = emu.mem_write_u64(addrinfo + 24, sockaddr);
    let _ = emu.mem_write_u64(addrinfo + 32, 0);
    let _ = emu.mem_write_u64(addrinfo + 40, 0);

    let _ = emu.mem_write_u16(sockaddr, 2);
    let _ = emu.mem_write_u16(sockaddr + 2, 0x5000); // port 80, network order
    let _ = emu.mem_write(sockaddr + 4, &[127, 0, 0, 1]);

    if res != 0 {
        let _ = emu.mem_write_u64(res, addrinfo);
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_gethostbyname(emu: &mut Emulator) -> bool {
    let name_ptr = emu.x(0);
    let name = emu.mem_read_string(name_ptr, 256).unwrap_or_default();
    if !name.is_empty() {
        capture_host("127.0.0.1", 0, &name, "gethostbyname");
    }
    stubs::log_call(emu, "network", "gethostbyname", &name);

    // struct hostent { *h_name, **h_aliases, addrtype, length, **h_addr_list }
    let hostent = emu.malloc(64);
    let addr_list = emu.malloc(16);
    let addr = emu.malloc(4);

    let _ = emu.mem_write(addr, &[127, 0, 0, 1]);
    let _ = emu.mem_write_u64(addr_list, addr);
    let _ = emu.mem_write_u64(addr_list + 8, 0);

    let _ = emu.mem_write_u64(hostent, name_ptr);
    let _ = emu.mem_write_u64(hostent + 8, 0);
    let _ = emu.mem_write_u32(hostent + 16, 2); // AF_INET
    let _ = emu.mem_write_u32(hostent + 20, 4);
    let _ = emu.mem_write_u64(hostent + 24, addr_list);

    let _ = emu.set_x(0, hostent);
    return_from_stub(emu);
    false
}

fn stub_getpeername(emu: &mut Emulator) -> bool {
    let addr = emu.x(1);
    let len = emu.x(2);
    if addr != 0 {
        let _ = emu.mem_write_u16(addr, 2);
        let _ = emu.mem_write_u16(addr + 2, 0x5000);
        let _ = emu.mem_write(addr + 4, &[127, 0, 0, 1]);
    }
    if len != 0 {
        let _ = emu.mem_write_u32(len, 16);
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_inet_aton(emu: &mut Emulator) -> bool {
    let inp = emu.x(1);
    if inp != 0 {
        let _ = emu.mem_write_u32(inp, 0x0100_007f); // 127.0.0.1 network order
    }
    let _ = emu.set_x(0, 1);
    return_from_stub(emu);
    false
}

fn stub_inet_ntoa(emu: &mut Emulator) -> bool {
    let buf = emu.malloc(16);
    let _ = emu.mem_write_string(buf, "127.0.0.1");
    let _ = emu.set_x(0, buf);
    return_from_stub(emu);
    false
}

fn stub_inet_pton(emu: &mut Emulator) -> bool {
    let dst = emu.x(2);
    if dst != 0 {
        let _ = emu.mem_write_u32(dst, 0x0100_007f);
    }
    let _ = emu.set_x(0, 1);
    return_from_stub(emu);
    false
}

fn stub_inet_ntop(emu: &mut Emulator) -> bool {
    let dst = emu.x(2);
    if dst != 0 {
        let _ = emu.mem_write_string(dst, "127.0.0.1");
    }
    let _ = emu.set_x(0, dst);
    return_from_stub(emu);
    false
}

fn stub_swap16(emu: &mut Emulator) -> bool {
    let val = emu.x(0) as u16;
    let _ = emu.set_x(0, val.swap_bytes() as u64);
    return_from_stub(emu);
    false
}

fn stub_swap32(emu: &mut Emulator) -> bool {
    let val = emu.x(0) as u32;
    let _ = emu.set_x(0, val.swap_bytes() as u64);
    return_from_stub(emu);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stubs::network::captured_hosts;

    #[test]
    fn getaddrinfo_fabricates_result_and_captures_host() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();

        let node = emu.malloc(32);
        emu.mem_write_string(node, "api.example.com").unwrap();
        let service = emu.malloc(8);
        emu.mem_write_string(service, "443").unwrap();
        let res = emu.malloc(8);

        emu.set_x(0, node).unwrap();
        emu.set_x(1, service).unwrap();
        emu.set_x(2, 0).unwrap();
        emu.set_x(3, res).unwrap();
        stub_getaddrinfo(&mut emu);

        assert_eq!(emu.x(0), 0);
        let addrinfo = emu.mem_read_u64(res).unwrap();
        assert_ne!(addrinfo, 0);
        assert_eq!(emu.mem_read_u32(addrinfo + 4).unwrap(), 2);
        let sockaddr = emu.mem_read_u64(addrinfo + 24).unwrap();
        assert_eq!(emu.mem_read_u16(sockaddr).unwrap(), 2);

        let hosts = captured_hosts();
        assert!(hosts
            .iter()
            .any(|h| h.hostname == "api.example.com" && h.port == 443));
    }

    #[test]
    fn byte_order_helpers_swap() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();

        emu.set_x(0, 0x1234).unwrap();
        stub_swap16(&mut emu);
        assert_eq!(emu.x(0), 0x3412);

        emu.set_x(0, 0x1234_5678).unwrap();
        stub_swap32(&mut emu);
        assert_eq!(emu.x(0), 0x7856_3412);
    }
}
