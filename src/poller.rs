//! 基于 `poll(2)` 的就绪事件轮询
//!
//! 所有服务共享同一个 [`Poller`]，每个注册的 socket 绑定一个调用方分配的 [`Token`]，
//! 事件按 `poll` 返回的顺序交给持有该 socket 的服务处理。

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// 注册时由调用方分配的标识，事件通过它路由回所属服务
pub type Token = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(libc::c_short);

impl Interest {
    pub const READABLE: Interest = Interest(libc::POLLIN);
    pub const WRITABLE: Interest = Interest(libc::POLLOUT);
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness(libc::c_short);

impl Readiness {
    pub fn is_readable(&self) -> bool {
        self.0 & libc::POLLIN != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & libc::POLLOUT != 0
    }

    pub fn is_hangup(&self) -> bool {
        self.0 & libc::POLLHUP != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & (libc::POLLERR | libc::POLLNVAL) != 0
    }

    /// 只有挂断标志，没有可读/可写。UDP socket 上这类事件没有意义
    pub fn is_hangup_only(&self) -> bool {
        self.0 == libc::POLLHUP
    }
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Readiness {{ in: {}, out: {}, hup: {}, err: {} }}",
            self.is_readable(),
            self.is_writable(),
            self.is_hangup(),
            self.is_error()
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readiness: Readiness,
}

#[derive(Default)]
pub struct Poller {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, fd: RawFd) -> Option<usize> {
        self.fds.iter().position(|p| p.fd == fd)
    }

    pub fn register(
        &mut self,
        source: &impl AsRawFd,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        let fd = source.as_raw_fd();
        if self.position(fd).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {} already registered", fd),
            ));
        }
        self.fds.push(libc::pollfd {
            fd,
            events: interest.0,
            revents: 0,
        });
        self.tokens.push(token);
        Ok(())
    }

    pub fn modify(&mut self, source: &impl AsRawFd, interest: Interest) -> io::Result<()> {
        let fd = source.as_raw_fd();
        let idx = self.position(fd).ok_or_else(|| not_registered(fd))?;
        self.fds[idx].events = interest.0;
        Ok(())
    }

    pub fn deregister(&mut self, source: &impl AsRawFd) -> io::Result<()> {
        let fd = source.as_raw_fd();
        let idx = self.position(fd).ok_or_else(|| not_registered(fd))?;
        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// 阻塞等待至多 `timeout`，把就绪事件追加到 `events`。
    /// 被信号打断时返回 0，交给调用方检查退出标志。
    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize> {
        events.clear();
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for (pfd, token) in self.fds.iter_mut().zip(self.tokens.iter()) {
            if pfd.revents != 0 {
                events.push(Event {
                    token: *token,
                    readiness: Readiness(pfd.revents),
                });
                pfd.revents = 0;
            }
        }

        Ok(events.len())
    }
}

fn not_registered(fd: RawFd) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("fd {} is not registered", fd),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    #[test]
    fn test_readable_event_carries_token() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut poller = Poller::new();
        poller.register(&rx, 7, Interest::READABLE).unwrap();

        let mut events = Vec::new();
        assert_eq!(
            poller
                .poll(&mut events, Duration::from_millis(10))
                .unwrap(),
            0
        );

        tx.send_to(b"ping", rx.local_addr().unwrap()).unwrap();
        let n = poller.poll(&mut events, Duration::from_secs(2)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].readiness.is_readable());
        assert!(!events[0].readiness.is_hangup_only());
    }

    #[test]
    fn test_modify_and_deregister() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut poller = Poller::new();
        poller.register(&sock, 1, Interest::READABLE).unwrap();
        assert!(poller.register(&sock, 2, Interest::READABLE).is_err());

        poller.modify(&sock, Interest::WRITABLE).unwrap();
        let mut events = Vec::new();
        poller.poll(&mut events, Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readiness.is_writable());

        poller.deregister(&sock).unwrap();
        assert!(poller.is_empty());
        assert!(poller.deregister(&sock).is_err());
        assert!(poller.modify(&sock, Interest::READABLE).is_err());
    }
}
