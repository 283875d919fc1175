//! 配网 HTTP 服务
//!
//! 单线程非阻塞：每个连接先累积请求头，遇到 `\r\n\r\n` 后解析并生成响应，
//! 响应通过固定大小的发送窗口分块写出，写满或对端阻塞时等下一次可写事件。

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;

use crate::poller::{Event, Interest, Poller, Token};

use super::credentials::{staged_slot, StagedReader};
use super::handlers::{
    self, redirect_head, Route, RouteContext, RouteTable, NOT_FOUND_HEAD, OK_HEAD,
};
use super::listener::{set_reuse_address, ListenSocket, Listener, Protocol, Service};
use super::request::HttpRequest;

/// TCP/IP 最小 MSS，单次写出不超过这个大小
pub const WINDOW_SIZE: usize = 536;
/// 请求头累积上限，超过直接断开
pub const MAX_REQUEST_LEN: usize = 4096;
const READ_CHUNK: usize = 512;

pub type Body = Box<dyn Read>;

fn text_body(s: &'static [u8]) -> Body {
    Box::new(io::Cursor::new(s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// 还有数据，等待下一次可写
    Pending,
    Finished,
    /// 对端一个字节都不收
    PeerGone,
}

/// 发送窗口：响应头 + 响应体按窗口大小分块
pub struct OutboundWindow {
    source: Body,
    buf: Box<[u8; WINDOW_SIZE]>,
    start: usize,
    end: usize,
}

impl OutboundWindow {
    /// 预先填入响应头（已含结束空行），剩余空间用响应体填满
    pub fn new(head: &[u8], body: Body) -> io::Result<Self> {
        let source: Body = Box::new(io::Cursor::new(head.to_vec()).chain(body));
        let mut window = Self {
            source,
            buf: Box::new([0; WINDOW_SIZE]),
            start: 0,
            end: 0,
        };
        window.end = window.fill()?;
        Ok(window)
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut filled = 0;
        while filled < WINDOW_SIZE {
            match self.source.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub fn unsent(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// 写出当前未发送的部分。
    ///
    /// 整个窗口都被接收时从响应体补满窗口；只接收了一部分时推进起点，剩余留待下次。
    /// 不满一个窗口的尾块全部写完才算结束。
    pub fn send(&mut self, out: &mut impl Write) -> io::Result<WriteProgress> {
        let n = out.write(&self.buf[self.start..self.end])?;
        if n == 0 {
            return Ok(WriteProgress::PeerGone);
        }

        self.start += n;
        if self.start < self.end {
            return Ok(WriteProgress::Pending);
        }
        if self.end < WINDOW_SIZE {
            return Ok(WriteProgress::Finished);
        }

        self.start = 0;
        self.end = self.fill()?;
        if self.end == 0 {
            Ok(WriteProgress::Finished)
        } else {
            Ok(WriteProgress::Pending)
        }
    }
}

enum Phase {
    /// 请求头还没收完
    Reading(Vec<u8>),
    Writing(OutboundWindow),
}

struct Connection {
    stream: TcpStream,
    phase: Phase,
}

/// 连接槽位，accept 时分配、close 时释放，下标即事件 token 的偏移
struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slots<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = Some(value);
                idx
            }
            None => {
                self.entries.push(Some(value));
                self.entries.len() - 1
            }
        }
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.entries.get_mut(idx)?.as_mut()
    }

    fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.entries.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(value)
    }

    fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    fn drain(&mut self) -> Vec<T> {
        self.free.clear();
        self.entries.drain(..).flatten().collect()
    }
}

pub struct ProvisioningHttp {
    listener: Listener,
    port: u16,
    address: String,
    network: Option<String>,
    routes: RouteTable,
    connected: bool,
    staged: StagedReader,
    conns: Slots<Connection>,
}

impl ProvisioningHttp {
    /// `token` 给监听 socket 用，之后的 token 留给各个连接
    pub fn start(
        port: u16,
        backlog: i32,
        address: &str,
        www_dir: &Path,
        token: Token,
        poller: &mut Poller,
    ) -> anyhow::Result<Self> {
        let listener = Listener::start("HTTP Server", port, Protocol::Tcp { backlog }, token, poller)?;
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
        let (writer, staged) = staged_slot();

        Ok(Self {
            listener,
            port,
            address: address.to_string(),
            network: None,
            routes: handlers::provisioning_routes(www_dir, writer),
            connected: false,
            staged,
            conns: Slots::new(),
        })
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn is_connected_mode(&self) -> bool {
        self.connected
    }

    /// 登录处理器暂存的凭据，由编排器读取
    pub fn staged(&self) -> &StagedReader {
        &self.staged
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn conn_token(&self, slot: usize) -> Token {
        self.listener.token() + 1 + slot
    }

    fn slot_of(&self, token: Token) -> Option<usize> {
        token.checked_sub(self.listener.token() + 1)
    }

    /// 单向切换到已连接模式，只保留状态页
    pub fn adopt_connected_mode(&mut self, new_address: &str, network_name: &str) {
        log::info!(
            "HTTP server switching to connected mode: {} on {}",
            new_address,
            network_name
        );
        self.address = new_address.to_string();
        self.network = Some(network_name.to_string());
        self.routes = handlers::connected_routes();
        self.connected = true;
    }

    fn host_matches(&self, host: &str) -> bool {
        if host == self.address {
            return true;
        }
        self.port != 80
            && host
                .strip_prefix(self.address.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .is_some_and(|port| port == self.port.to_string())
    }

    /// 根据请求生成响应体和响应头（不含结束空行）
    pub fn respond(&self, req: &HttpRequest) -> (Body, String) {
        if req.is_invalid() || !self.host_matches(&req.host) {
            // 强制跳转到设备地址，系统的门户检测会因此弹出登录页
            return (text_body(b""), redirect_head(&self.address));
        }

        match self.routes.get(&req.path) {
            None => (text_body(b"Not Found"), NOT_FOUND_HEAD.to_string()),
            Some(Route::StaticFile(path)) => match std::fs::File::open(path) {
                Ok(file) => {
                    let mut head = OK_HEAD.to_string();
                    if path.extension().is_some_and(|ext| ext == "html") {
                        head.push_str("Content-Type: text/html\r\n");
                    }
                    (Box::new(file), head)
                }
                Err(e) => {
                    log::error!("Failed to open {}: {}", path.display(), e);
                    (text_body(b"File not found"), NOT_FOUND_HEAD.to_string())
                }
            },
            Some(Route::Embedded(page)) => (
                text_body(*page),
                format!("{}Content-Type: text/html\r\n", OK_HEAD),
            ),
            Some(Route::Handler(handler)) => {
                let ctx = RouteContext {
                    address: &self.address,
                    network: self.network.as_deref(),
                };
                let reply = handler(&ctx, &req.params);
                let body = reply.body.unwrap_or_default();
                let head = reply.head.unwrap_or_else(|| OK_HEAD.to_string());
                (Box::new(io::Cursor::new(body)), head)
            }
        }
    }

    fn accept(&mut self, poller: &mut Poller) {
        let Some(ListenSocket::Tcp(server)) = self.listener.socket() else {
            return;
        };

        let (stream, addr) = match server.accept() {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::error!("Error accepting connection: {}", e);
                return;
            }
        };
        log::info!("Accepted connection from {}", addr);

        if let Err(e) = stream
            .set_nonblocking(true)
            .and_then(|_| set_reuse_address(&stream))
        {
            log::error!("Failed to configure connection from {}: {}", addr, e);
            return;
        }

        let slot = self.conns.insert(Connection {
            stream,
            phase: Phase::Reading(Vec::new()),
        });
        let token = self.conn_token(slot);
        let registered = match self.conns.get_mut(slot) {
            Some(conn) => poller.register(&conn.stream, token, Interest::READABLE),
            None => return,
        };
        if let Err(e) = registered {
            log::error!("Failed to register connection from {}: {}", addr, e);
            self.conns.remove(slot);
        }
    }

    fn read(&mut self, poller: &mut Poller, slot: usize) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        let Phase::Reading(request) = &mut conn.phase else {
            return;
        };

        let mut chunk = [0u8; READ_CHUNK];
        let n = match conn.stream.read(&mut chunk) {
            Ok(0) => {
                self.close(poller, slot);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                log::warn!("Read error, closing connection: {}", e);
                self.close(poller, slot);
                return;
            }
        };

        request.extend_from_slice(&chunk[..n]);
        if !request.ends_with(b"\r\n\r\n") {
            if request.len() > MAX_REQUEST_LEN {
                log::warn!("Request header exceeds {} bytes, closing", MAX_REQUEST_LEN);
                self.close(poller, slot);
            }
            return;
        }

        let raw = std::mem::take(request);
        let req = HttpRequest::parse(&raw).unwrap_or_else(|e| {
            log::warn!("Failed to parse HTTP request: {}", e);
            HttpRequest::invalid()
        });
        log::info!("{} {} (Host: {})", req.method, req.path, req.host);

        let (body, head) = self.respond(&req);
        self.prepare_write(poller, slot, body, head);
    }

    /// 进入写阶段：建立发送窗口并改为关注可写事件
    fn prepare_write(&mut self, poller: &mut Poller, slot: usize, body: Body, mut head: String) {
        if !head.to_ascii_lowercase().contains("\r\nconnection:") {
            head.push_str("Connection: close\r\n");
        }
        // 空行分隔响应头与响应体
        head.push_str("\r\n");

        let window = match OutboundWindow::new(head.as_bytes(), body) {
            Ok(window) => window,
            Err(e) => {
                log::error!("Failed to read response body: {}", e);
                self.close(poller, slot);
                return;
            }
        };

        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        conn.phase = Phase::Writing(window);
        if let Err(e) = poller.modify(&conn.stream, Interest::WRITABLE) {
            log::error!("Failed to switch connection to write: {}", e);
            self.close(poller, slot);
        }
    }

    fn write_to(&mut self, poller: &mut Poller, slot: usize) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        let Phase::Writing(window) = &mut conn.phase else {
            return;
        };

        match window.send(&mut conn.stream) {
            Ok(WriteProgress::Pending) => {}
            Ok(WriteProgress::Finished) | Ok(WriteProgress::PeerGone) => self.close(poller, slot),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("Write error, closing connection: {}", e);
                self.close(poller, slot);
            }
        }
    }

    /// 关闭连接，同时释放请求缓冲和发送窗口
    fn close(&mut self, poller: &mut Poller, slot: usize) {
        if let Some(conn) = self.conns.remove(slot) {
            if let Err(e) = poller.deregister(&conn.stream) {
                log::warn!("Deregister failed: {}", e);
            }
            drop(conn);
            log::debug!("Closed connection");
        }
    }

    /// 关闭所有连接和监听 socket
    pub fn stop(&mut self, poller: &mut Poller) {
        for conn in self.conns.drain() {
            let _ = poller.deregister(&conn.stream);
        }
        self.listener.stop(poller);
    }
}

impl Service for ProvisioningHttp {
    fn on_event(&mut self, poller: &mut Poller, event: &Event) {
        if event.token == self.listener.token() {
            // 80 端口上有新连接
            self.accept(poller);
            return;
        }

        let Some(slot) = self.slot_of(event.token) else {
            return;
        };
        let phase_reading = match self.conns.get_mut(slot) {
            Some(conn) => matches!(conn.phase, Phase::Reading(_)),
            None => {
                log::debug!("Event for closed connection {}", event.token);
                return;
            }
        };

        let ready = event.readiness;
        if phase_reading && ready.is_readable() {
            self.read(poller, slot);
        } else if !phase_reading && ready.is_writable() {
            self.write_to(poller, slot);
        } else if ready.is_hangup() || ready.is_error() {
            self.close(poller, slot);
        }
    }
}
