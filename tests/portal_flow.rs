use std::cell::Cell;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpStream, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use wifi_portal::captive_portal::{
    Clock, CredentialStore, Credentials, PortalOrchestrator, PortalState,
};
use wifi_portal::radio::{AccessPointConfig, Radio};
use wifi_portal::PortalConfig;

const STATION_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 23);

/// 只有密码正确才会连上的射频
#[derive(Default)]
struct FakeRadio {
    password: Option<String>,
    station_active: bool,
    connected: bool,
    ap_active: bool,
    ap_config: Option<AccessPointConfig>,
    connect_calls: usize,
}

impl FakeRadio {
    fn accepting(password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..Default::default()
        }
    }
}

impl Radio for FakeRadio {
    fn set_station_active(&mut self, active: bool) -> anyhow::Result<()> {
        self.station_active = active;
        if !active {
            self.connected = false;
        }
        Ok(())
    }

    fn connect(&mut self, credentials: &Credentials) -> anyhow::Result<()> {
        anyhow::ensure!(self.station_active, "station off");
        self.connect_calls += 1;
        self.connected = self.password.as_deref() == Some(credentials.password.as_str());
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.station_active && self.connected
    }

    fn station_address(&mut self) -> Option<Ipv4Addr> {
        self.connected.then_some(STATION_ADDRESS)
    }

    fn set_access_point_active(&mut self, active: bool) -> anyhow::Result<()> {
        self.ap_active = active;
        Ok(())
    }

    fn is_access_point_active(&mut self) -> bool {
        self.ap_active
    }

    fn configure_access_point(&mut self, config: &AccessPointConfig) -> anyhow::Result<()> {
        self.ap_config = Some(config.clone());
        Ok(())
    }

    fn hardware_id(&mut self) -> [u8; 6] {
        [0x28, 0xcd, 0xc1, 0x0a, 0xb2, 0x3f]
    }
}

#[derive(Default)]
struct MemoryStore {
    record: Option<Credentials>,
    corrupt: bool,
    removed: usize,
}

impl CredentialStore for MemoryStore {
    fn load(&mut self) -> anyhow::Result<Option<Credentials>> {
        anyhow::ensure!(!self.corrupt, "corrupt record");
        Ok(self.record.clone())
    }

    fn save(&mut self, credentials: &Credentials) -> anyhow::Result<()> {
        self.record = Some(credentials.clone());
        Ok(())
    }

    fn remove(&mut self) -> anyhow::Result<()> {
        self.record = None;
        self.corrupt = false;
        self.removed += 1;
        Ok(())
    }
}

#[derive(Clone)]
struct ManualClock {
    base: Instant,
    offset: Rc<Cell<Duration>>,
}

impl ManualClock {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    fn advance(&self, d: Duration) {
        self.offset.set(self.offset.get() + d);
    }

    fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

type Portal = PortalOrchestrator<FakeRadio, MemoryStore, ManualClock>;

fn test_config(www: &std::path::Path) -> PortalConfig {
    PortalConfig {
        ap_address: "127.0.0.1".to_string(),
        essid_prefix: "Pico".to_string(),
        dns_port: 0,
        http_port: 0,
        www_dir: www.to_path_buf(),
        poll_timeout_ms: 20,
        ..Default::default()
    }
}

fn portal(radio: FakeRadio, store: MemoryStore) -> (Portal, ManualClock, tempfile::TempDir) {
    let www = tempfile::tempdir().unwrap();
    std::fs::write(www.path().join("index.html"), "<form action=\"/login\"></form>").unwrap();
    let clock = ManualClock::new();
    let portal = PortalOrchestrator::new(test_config(www.path()), radio, store, clock.clone())
        .unwrap();
    (portal, clock, www)
}

fn http_port(portal: &Portal) -> u16 {
    portal
        .http()
        .unwrap()
        .listener()
        .local_addr()
        .unwrap()
        .port()
}

fn dns_port(portal: &Portal) -> u16 {
    portal
        .dns()
        .unwrap()
        .listener()
        .local_addr()
        .unwrap()
        .port()
}

fn http_get(portal: &mut Portal, host: &str, target: &str) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", http_port(portal))).unwrap();
    write!(client, "GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, host).unwrap();
    client.set_nonblocking(true).unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    for _ in 0..500 {
        portal.tick();
        loop {
            match client.read(&mut buf) {
                Ok(0) => return String::from_utf8(response).unwrap(),
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }
    panic!("no complete HTTP response");
}

fn dns_query(id: u16, domain: &str) -> Vec<u8> {
    let mut packet = id.to_be_bytes().to_vec();
    packet.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.extend_from_slice(&[0, 0, 1, 0, 1]);
    packet
}

#[test]
fn stored_credentials_connect_without_portal() {
    let store = MemoryStore {
        record: Some(Credentials::new("home", "secret")),
        ..Default::default()
    };
    let (mut portal, _clock, _www) = portal(FakeRadio::accepting("secret"), store);

    assert_eq!(portal.start().unwrap(), PortalState::Connected);
    assert_eq!(portal.local_address(), "10.0.0.23");
    assert!(portal.dns().is_none());
    assert!(portal.http().is_none());
    assert!(!portal.radio().ap_active);
    assert_eq!(
        portal.store().record,
        Some(Credentials::new("home", "secret"))
    );
}

#[test]
fn failed_stored_credentials_fall_back_to_portal() {
    let store = MemoryStore {
        record: Some(Credentials::new("home", "stale")),
        ..Default::default()
    };
    let (mut portal, clock, _www) = portal(FakeRadio::accepting("secret"), store);

    assert_eq!(portal.start().unwrap(), PortalState::PortalActive);
    assert_eq!(portal.connect_attempts(), 10);
    assert_eq!(clock.elapsed(), Duration::from_secs(20));
    assert!(portal.credentials().is_none());
    assert!(!portal.radio().station_active);
    assert_eq!(portal.store().record, None);
    assert_eq!(portal.store().removed, 1);

    let ap = portal.radio().ap_config.clone().unwrap();
    assert_eq!(ap.essid, "Pico-0ab23f");
    assert_eq!(ap.address, Ipv4Addr::LOCALHOST);
    assert_eq!(ap.gateway(), ap.dns());
    assert!(portal.radio().ap_active);
    assert!(portal.dns().unwrap().is_running());
    assert_eq!(portal.poller().len(), 2);
}

#[test]
fn corrupt_record_is_removed() {
    let store = MemoryStore {
        corrupt: true,
        ..Default::default()
    };
    let (mut portal, _clock, _www) = portal(FakeRadio::accepting("secret"), store);

    assert_eq!(portal.start().unwrap(), PortalState::PortalActive);
    assert_eq!(portal.store().removed, 1);
    assert_eq!(portal.radio().connect_calls, 0);
}

#[test]
fn dns_answers_every_name_with_portal_address() {
    let (mut portal, _clock, _www) = portal(FakeRadio::default(), MemoryStore::default());
    portal.start().unwrap();
    let port = dns_port(&portal);

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_nonblocking(true).unwrap();

    for (id, name) in [(1u16, "example.com"), (2, "connectivitycheck.gstatic.com")] {
        // 先发一个越界的坏包，服务必须继续工作
        let mut bad = dns_query(id, name);
        bad[12] = 63;
        client.send_to(&bad, ("127.0.0.1", port)).unwrap();

        let query = dns_query(id, name);
        client.send_to(&query, ("127.0.0.1", port)).unwrap();

        let mut reply = [0u8; 512];
        let mut len = None;
        for _ in 0..200 {
            portal.tick();
            if let Ok((n, _)) = client.recv_from(&mut reply) {
                len = Some(n);
                break;
            }
        }
        let n = len.expect("no DNS reply");
        assert_eq!(&reply[0..2], &id.to_be_bytes());
        assert_eq!(&reply[6..8], &[0, 1]);
        assert_eq!(&reply[12..query.len()], &query[12..]);
        assert_eq!(&reply[n - 4..n], &[127, 0, 0, 1]);
    }
}

#[test]
fn foreign_host_is_redirected_and_local_pages_served() {
    let (mut portal, _clock, _www) = portal(FakeRadio::default(), MemoryStore::default());
    portal.start().unwrap();

    let response = http_get(&mut portal, "captive.apple.com", "/hotspot-detect.html");
    assert!(response.starts_with("HTTP/1.1 307 Temporary Redirect\r\n"));
    assert!(response.contains("Location: http://127.0.0.1/\r\n"));
    assert!(response.ends_with("\r\n\r\n"));

    let response = http_get(&mut portal, "127.0.0.1", "/");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("<form action=\"/login\"></form>"));

    let response = http_get(&mut portal, "127.0.0.1", "/missing");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

    // 所有连接都已关闭，只剩两个监听 socket
    assert_eq!(portal.http().unwrap().connection_count(), 0);
    assert_eq!(portal.poller().len(), 2);
}

#[test]
fn large_page_is_sent_across_windows() {
    let (mut portal, _clock, www) = portal(FakeRadio::default(), MemoryStore::default());
    let page: String = (0..4000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    std::fs::write(www.path().join("index.html"), &page).unwrap();
    portal.start().unwrap();

    let response = http_get(&mut portal, "127.0.0.1", "/");
    let (_head, body) = response.split_once("\r\n\r\n").unwrap();
    assert_eq!(body, page);
}

#[test]
fn wrong_password_keeps_portal_running() {
    let (mut portal, clock, _www) = portal(FakeRadio::accepting("secret"), MemoryStore::default());
    portal.start().unwrap();

    let response = http_get(&mut portal, "127.0.0.1", "/login?ssid=home&password=wrong");
    assert!(response.starts_with("HTTP/1.1 307"));
    portal.tick();

    assert_eq!(portal.radio().connect_calls, 1);
    assert_eq!(clock.elapsed(), Duration::from_secs(20));
    assert_eq!(portal.state(), PortalState::PortalActive);
    assert!(!portal.radio().station_active);
    assert!(portal.store().record.is_none());

    // 凭据只尝试一次，不会反复阻塞
    portal.tick();
    assert_eq!(portal.radio().connect_calls, 1);
}

#[test]
fn login_connects_then_shuts_down_access_point_after_cooldown() {
    let (mut portal, clock, _www) = portal(FakeRadio::accepting("secret"), MemoryStore::default());
    portal.start().unwrap();

    // 缺字段：照样重定向，但不会尝试连接
    let response = http_get(&mut portal, "127.0.0.1", "/login?ssid=home");
    assert!(response.starts_with("HTTP/1.1 307"));
    assert_eq!(portal.radio().connect_calls, 0);

    let response = http_get(&mut portal, "127.0.0.1", "/login?ssid=home&password=secret");
    assert!(response.starts_with("HTTP/1.1 307"));
    portal.tick();
    assert_eq!(portal.radio().connect_calls, 1);
    assert_eq!(portal.local_address(), "10.0.0.23");
    assert_eq!(
        portal.store().record,
        Some(Credentials::new("home", "secret"))
    );

    portal.tick();
    assert_eq!(portal.state(), PortalState::CooldownRunning);
    assert!(portal.radio().ap_active);

    clock.advance(Duration::from_secs(30));
    portal.tick();
    assert_eq!(portal.state(), PortalState::CooldownRunning);

    clock.advance(Duration::from_secs(31));
    portal.tick();
    assert_eq!(portal.state(), PortalState::Connected);
    assert!(!portal.radio().ap_active);
    assert!(!portal.dns().unwrap().is_running());
    assert_eq!(portal.poller().len(), 1);

    let http = portal.http().unwrap();
    assert!(http.is_connected_mode());
    assert_eq!(http.address(), "10.0.0.23");
    assert_eq!(http.network(), Some("home"));

    let response = http_get(&mut portal, "10.0.0.23", "/");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("home"));

    let response = http_get(&mut portal, "10.0.0.23", "/login?ssid=x&password=y");
    assert!(response.starts_with("HTTP/1.1 404"));

    portal.shutdown();
    assert!(portal.poller().is_empty());
}
