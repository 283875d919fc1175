//! DNS 劫持服务
//!
//! 不论查询什么域名，都回答一条指向设备当前地址的 A 记录，
//! 让连上 AP 的手机/电脑弹出登录页。

use std::io;

use crate::poller::{Event, Poller, Token};

use super::listener::{ListenSocket, Listener, Protocol, Service};

const HEADER_LEN: usize = 12;
/// 域名总长度的实际上限
const MAX_NAME_LEN: usize = 255;
const ANSWER_TTL: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// 不是 4 段
    SegmentCount(usize),
    /// 某段不是 0-255 的数字
    Segment(String),
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::SegmentCount(n) => write!(f, "expected 4 segments, got {}", n),
            AddressError::Segment(s) => write!(f, "segment {:?} is not a byte", s),
        }
    }
}

impl std::error::Error for AddressError {}

/// 把点分十进制地址拆成 4 个字节
pub fn parse_address(addr: &str) -> Result<[u8; 4], AddressError> {
    let segments: Vec<&str> = addr.split('.').collect();
    if segments.len() != 4 {
        return Err(AddressError::SegmentCount(segments.len()));
    }

    let mut octets = [0u8; 4];
    for (octet, segment) in octets.iter_mut().zip(segments) {
        *octet = segment
            .parse::<u8>()
            .map_err(|_| AddressError::Segment(segment.to_string()))?;
    }
    Ok(octets)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// 报文在头部或问题区中途结束
    Truncated(usize),
    /// 标签长度超出报文剩余字节
    LabelOverrun { offset: usize, len: usize },
    /// 压缩指针或保留位，问题区里不该出现
    BadLabel(u8),
    NameTooLong,
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::Truncated(len) => write!(f, "packet truncated at {} bytes", len),
            DnsError::LabelOverrun { offset, len } => {
                write!(f, "label of {} bytes at offset {} overruns packet", len, offset)
            }
            DnsError::BadLabel(b) => write!(f, "unexpected label byte {:#04x}", b),
            DnsError::NameTooLong => write!(f, "domain name longer than {} bytes", MAX_NAME_LEN),
        }
    }
}

impl std::error::Error for DnsError {}

/// 一个收到的查询报文，只在一次请求/应答中存在
#[derive(Debug)]
pub struct DnsQuery<'a> {
    data: &'a [u8],
    /// 问题区结束位置（QNAME + QTYPE + QCLASS）
    question_end: usize,
    pub domain: String,
}

impl<'a> DnsQuery<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, DnsError> {
        if data.len() <= HEADER_LEN {
            return Err(DnsError::Truncated(data.len()));
        }

        let mut domain = String::new();
        let mut head = HEADER_LEN;
        loop {
            let len = *data.get(head).ok_or(DnsError::Truncated(data.len()))?;
            if len == 0 {
                head += 1;
                break;
            }
            if len & 0xC0 != 0 {
                return Err(DnsError::BadLabel(len));
            }
            let label = head + 1;
            let len = len as usize;
            if label + len > data.len() {
                return Err(DnsError::LabelOverrun { offset: head, len });
            }
            domain.push_str(&String::from_utf8_lossy(&data[label..label + len]));
            domain.push('.');
            if domain.len() > MAX_NAME_LEN {
                return Err(DnsError::NameTooLong);
            }
            head = label + len;
        }

        // QTYPE + QCLASS
        let question_end = head + 4;
        if question_end > data.len() {
            return Err(DnsError::Truncated(data.len()));
        }

        Ok(Self {
            data,
            question_end,
            domain,
        })
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn question(&self) -> &'a [u8] {
        &self.data[HEADER_LEN..self.question_end]
    }

    /// 构造应答：原问题区 + 一条压缩指针指向 offset 12 的 A 记录
    pub fn answer(&self, address: [u8; 4]) -> Vec<u8> {
        let question = self.question();
        let mut packet = Vec::with_capacity(HEADER_LEN + question.len() + 16);

        // ID
        packet.extend_from_slice(&self.data[0..2]);
        // standard query response, no error, recursion available
        packet.extend_from_slice(&[0x81, 0x80]);
        // QDCOUNT, ANCOUNT = QDCOUNT
        packet.extend_from_slice(&self.data[4..6]);
        packet.extend_from_slice(&self.data[4..6]);
        // NSCOUNT, ARCOUNT
        packet.extend_from_slice(&[0, 0, 0, 0]);

        packet.extend_from_slice(question);

        packet.extend_from_slice(&[0xC0, 0x0C]);
        // TYPE A, CLASS IN
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        packet.extend_from_slice(&4u16.to_be_bytes());
        packet.extend_from_slice(&address);

        packet
    }
}

/// 监听 UDP 端口的 DNS 劫持服务，不保存任何跨请求状态
pub struct SpoofingResolver {
    listener: Listener,
    address: [u8; 4],
    buf: Vec<u8>,
}

impl SpoofingResolver {
    pub fn start(
        port: u16,
        address: &str,
        buffer_size: usize,
        token: Token,
        poller: &mut Poller,
    ) -> anyhow::Result<Self> {
        let address = parse_address(address)
            .map_err(|e| anyhow::anyhow!("Invalid DNS answer address {:?}: {}", address, e))?;
        let listener = Listener::start("DNS Server", port, Protocol::Udp, token, poller)?;
        Ok(Self {
            listener,
            address,
            buf: vec![0; buffer_size],
        })
    }

    pub fn stop(&mut self, poller: &mut Poller) {
        self.listener.stop(poller);
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    pub fn token(&self) -> Token {
        self.listener.token()
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn address(&self) -> [u8; 4] {
        self.address
    }

    /// 解析一个数据报并生成应答，格式错误的报文返回 None
    pub fn respond(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        match DnsQuery::parse(datagram) {
            Ok(query) => {
                log::info!(
                    "Sending {} -> {}.{}.{}.{}",
                    query.domain,
                    self.address[0],
                    self.address[1],
                    self.address[2],
                    self.address[3]
                );
                Some(query.answer(self.address))
            }
            Err(e) => {
                log::warn!("Dropping malformed DNS query: {}", e);
                None
            }
        }
    }

    fn serve_one(&mut self) -> io::Result<()> {
        let Some(ListenSocket::Udp(socket)) = self.listener.socket() else {
            return Ok(());
        };

        let (len, sender) = match socket.recv_from(&mut self.buf) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Some(reply) = self.respond(&self.buf[..len]) {
            socket.send_to(&reply, sender)?;
        }
        Ok(())
    }
}

impl Service for SpoofingResolver {
    fn on_event(&mut self, _poller: &mut Poller, event: &Event) {
        // 不会派生其他 socket，只处理自己的
        if event.token != self.listener.token() || !event.readiness.is_readable() {
            return;
        }
        if let Err(e) = self.serve_one() {
            log::error!("DNS server exception: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_query(id: u16, domain: &str) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&id.to_be_bytes());
    // RD
    packet.extend_from_slice(&[0x01, 0x00]);
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    // QTYPE A, QCLASS IN
    packet.extend_from_slice(&[0, 1, 0, 1]);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("192.168.4.1").unwrap(), [192, 168, 4, 1]);
        assert_eq!(
            parse_address("192.168.4"),
            Err(AddressError::SegmentCount(3))
        );
        assert!(matches!(
            parse_address("192.168.4.300"),
            Err(AddressError::Segment(_))
        ));
        assert!(matches!(
            parse_address("192.168.x.1"),
            Err(AddressError::Segment(_))
        ));
    }

    #[test]
    fn test_answer_example_com() {
        let query = encode_query(0xbeef, "example.com");
        let parsed = DnsQuery::parse(&query).unwrap();
        assert_eq!(parsed.domain, "example.com.");
        assert_eq!(parsed.id(), 0xbeef);

        let reply = parsed.answer([192, 168, 4, 1]);
        assert_eq!(&reply[0..2], &[0xbe, 0xef]);
        assert_eq!(&reply[2..4], &[0x81, 0x80]);
        // QDCOUNT == ANCOUNT == 1
        assert_eq!(&reply[4..6], &[0, 1]);
        assert_eq!(&reply[6..8], &[0, 1]);
        assert_eq!(&reply[8..12], &[0, 0, 0, 0]);

        let question = &query[12..];
        assert_eq!(&reply[12..12 + question.len()], question);

        let rr = &reply[12 + question.len()..];
        assert_eq!(
            rr,
            &[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 192, 168, 4, 1]
        );
    }

    #[test]
    fn test_answer_ignores_trailing_additional_records() {
        let mut query = encode_query(1, "captive.apple.com");
        let question_len = query.len() - 12;
        // EDNS OPT record, ARCOUNT = 1
        query[11] = 1;
        query.extend_from_slice(&[0, 0, 41, 0x10, 0, 0, 0, 0, 0, 0, 0]);

        let reply = DnsQuery::parse(&query).unwrap().answer([10, 0, 0, 1]);
        assert_eq!(reply.len(), 12 + question_len + 16);
        assert_eq!(&reply[10..12], &[0, 0]);
        assert_eq!(&reply[reply.len() - 4..], &[10, 0, 0, 1]);
    }

    #[test]
    fn test_malformed_queries() {
        assert_eq!(DnsQuery::parse(&[0; 5]).unwrap_err(), DnsError::Truncated(5));

        // 标签长度越界
        let mut overrun = encode_query(2, "example.com");
        overrun[12] = 60;
        assert!(matches!(
            DnsQuery::parse(&overrun),
            Err(DnsError::LabelOverrun { offset: 12, len: 60 })
        ));

        // 缺少结束标签
        let query = encode_query(3, "example.com");
        let cut = &query[..12 + 1 + 7];
        assert!(DnsQuery::parse(cut).is_err());

        // 缺少 QTYPE/QCLASS
        let cut = &query[..query.len() - 2];
        assert!(matches!(DnsQuery::parse(cut), Err(DnsError::Truncated(_))));

        let mut pointer = encode_query(4, "example.com");
        pointer[12] = 0xC0;
        assert_eq!(DnsQuery::parse(&pointer).unwrap_err(), DnsError::BadLabel(0xC0));
    }

    #[test]
    fn test_name_too_long() {
        let long = vec!["a".repeat(63); 5].join(".");
        let query = encode_query(5, &long);
        assert_eq!(DnsQuery::parse(&query).unwrap_err(), DnsError::NameTooLong);
    }

    #[test]
    fn test_resolver_survives_malformed_datagram() {
        let mut poller = Poller::new();
        let mut resolver =
            SpoofingResolver::start(0, "192.168.4.1", 512, 0, &mut poller).unwrap();
        let port = resolver.listener().local_addr().unwrap().port();
        assert_eq!(resolver.address(), [192, 168, 4, 1]);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();

        let mut bad = encode_query(9, "example.com");
        bad[12] = 200;
        client.send_to(&bad, ("127.0.0.1", port)).unwrap();
        client
            .send_to(&encode_query(10, "example.com"), ("127.0.0.1", port))
            .unwrap();

        let mut events = Vec::new();
        let mut reply = [0u8; 512];
        let mut answered = None;
        for _ in 0..10 {
            poller
                .poll(&mut events, std::time::Duration::from_millis(200))
                .unwrap();
            for event in events.clone() {
                resolver.on_event(&mut poller, &event);
            }
            client.set_nonblocking(true).unwrap();
            if let Ok((n, _)) = client.recv_from(&mut reply) {
                answered = Some(n);
                break;
            }
        }

        let n = answered.expect("no DNS answer");
        assert_eq!(u16::from_be_bytes([reply[0], reply[1]]), 10);
        assert_eq!(&reply[n - 4..n], &[192, 168, 4, 1]);

        resolver.stop(&mut poller);
        assert!(!resolver.is_running());
        assert!(poller.is_empty());
    }
}
