//! 监听 socket 基础设施
//!
//! [`Listener`] 持有一个绑定好的 UDP/TCP socket 并在共享的 [`Poller`] 上注册可读事件，
//! DNS 与 HTTP 服务在此之上实现 [`Service`]。

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::Context;

use crate::poller::{Event, Interest, Poller, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp { backlog: i32 },
}

pub enum ListenSocket {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

impl AsRawFd for ListenSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            ListenSocket::Udp(s) => s.as_raw_fd(),
            ListenSocket::Tcp(s) => s.as_raw_fd(),
        }
    }
}

/// 服务处理自己名下 socket 的就绪事件
pub trait Service {
    fn on_event(&mut self, poller: &mut Poller, event: &Event);
}

pub struct Listener {
    name: &'static str,
    token: Token,
    socket: Option<ListenSocket>,
}

impl Listener {
    pub fn start(
        name: &'static str,
        port: u16,
        protocol: Protocol,
        token: Token,
        poller: &mut Poller,
    ) -> anyhow::Result<Self> {
        let socket = bind_reusable(port, protocol)
            .with_context(|| format!("{} failed to bind port {}", name, port))?;

        poller
            .register(&socket, token, Interest::READABLE)
            .with_context(|| format!("{} failed to register with poller", name))?;

        let listener = Self {
            name,
            token,
            socket: Some(socket),
        };
        log::info!("{} listening on {:?}", name, listener.local_addr());
        Ok(listener)
    }

    /// 注销并关闭 socket，重复调用无副作用
    pub fn stop(&mut self, poller: &mut Poller) {
        if let Some(socket) = self.socket.take() {
            if let Err(e) = poller.deregister(&socket) {
                log::warn!("{} deregister failed: {}", self.name, e);
            }
            drop(socket);
            log::info!("{} stopped", self.name);
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn socket(&self) -> Option<&ListenSocket> {
        self.socket.as_ref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.socket.as_ref()? {
            ListenSocket::Udp(s) => s.local_addr().ok(),
            ListenSocket::Tcp(s) => s.local_addr().ok(),
        }
    }
}

pub fn set_reuse_address(socket: &impl AsRawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let r = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// std 的 bind 没有机会在绑定前设置 SO_REUSEADDR，这里直接走 socket/setsockopt/bind
fn bind_reusable(port: u16, protocol: Protocol) -> io::Result<ListenSocket> {
    let ty = match protocol {
        Protocol::Udp => libc::SOCK_DGRAM,
        Protocol::Tcp { .. } => libc::SOCK_STREAM,
    };

    let raw = unsafe { libc::socket(libc::AF_INET, ty, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    set_reuse_address(&fd)?;

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
    };

    let r = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }

    match protocol {
        Protocol::Udp => {
            let socket = UdpSocket::from(fd);
            socket.set_nonblocking(true)?;
            Ok(ListenSocket::Udp(socket))
        }
        Protocol::Tcp { backlog } => {
            if unsafe { libc::listen(fd.as_raw_fd(), backlog) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let socket = TcpListener::from(fd);
            socket.set_nonblocking(true)?;
            Ok(ListenSocket::Tcp(socket))
        }
    }
}

#[test]
fn test_start_stop_is_idempotent() {
    let mut poller = Poller::new();
    let mut listener = Listener::start("Test UDP", 0, Protocol::Udp, 3, &mut poller).unwrap();
    assert_eq!(listener.name(), "Test UDP");
    assert!(listener.is_running());
    assert_eq!(poller.len(), 1);
    assert_ne!(listener.local_addr().unwrap().port(), 0);

    listener.stop(&mut poller);
    assert!(!listener.is_running());
    assert!(poller.is_empty());
    listener.stop(&mut poller);
    assert!(listener.local_addr().is_none());
}

#[test]
fn test_tcp_listener_accepts() {
    let mut poller = Poller::new();
    let listener =
        Listener::start("Test TCP", 0, Protocol::Tcp { backlog: 5 }, 4, &mut poller).unwrap();
    let port = listener.local_addr().unwrap().port();
    let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

    let mut events = Vec::new();
    poller
        .poll(&mut events, std::time::Duration::from_secs(2))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].token, 4);
    assert!(events[0].readiness.is_readable());
}
