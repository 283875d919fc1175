//! 配网流程编排
//!
//! 状态流转：`TryingStoredCredentials -> PortalActive -> CooldownRunning -> Connected`。
//! 存储的凭据连不上时进入 `PortalActive`，STA 一直未连接就一直停留在这里。
//! 连接成功后等待一段冷却时间再关闭 AP，让用户的浏览器有机会看到结果页。

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::PortalConfig;
use crate::poller::{Event, Poller, Token};
use crate::radio::{AccessPointConfig, Radio};

use super::credentials::{CredentialStore, Credentials};
use super::dns::{parse_address, SpoofingResolver};
use super::listener::Service;
use super::server::ProvisioningHttp;

pub const DNS_TOKEN: Token = 0;
/// HTTP 监听 socket，连接的 token 依次排在后面
pub const HTTP_TOKEN: Token = 1;

const AP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// 时间来源，测试里用手动推进的时钟代替真实等待
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    TryingStoredCredentials,
    PortalActive,
    CooldownRunning,
    Connected,
}

pub struct PortalOrchestrator<R: Radio, S: CredentialStore, C: Clock = SystemClock> {
    config: PortalConfig,
    poller: Poller,
    events: Vec<Event>,
    dns: Option<SpoofingResolver>,
    http: Option<ProvisioningHttp>,
    radio: R,
    store: S,
    clock: C,

    state: PortalState,
    ap_address: Ipv4Addr,
    essid: String,
    local_address: String,
    credentials: Option<Credentials>,
    connect_attempts: u32,
    cooldown_started: Option<Instant>,
}

impl<R: Radio, S: CredentialStore, C: Clock> PortalOrchestrator<R, S, C> {
    pub fn new(config: PortalConfig, mut radio: R, store: S, clock: C) -> anyhow::Result<Self> {
        let ap_address = parse_address(&config.ap_address)
            .map(Ipv4Addr::from)
            .map_err(|e| anyhow::anyhow!("Invalid ap_address {:?}: {}", config.ap_address, e))?;
        let essid = config.essid_for(&radio.hardware_id());

        Ok(Self {
            local_address: config.ap_address.clone(),
            config,
            poller: Poller::new(),
            events: Vec::new(),
            dns: None,
            http: None,
            radio,
            store,
            clock,
            state: PortalState::TryingStoredCredentials,
            ap_address,
            essid,
            credentials: None,
            connect_attempts: 0,
            cooldown_started: None,
        })
    }

    pub fn state(&self) -> PortalState {
        self.state
    }

    pub fn essid(&self) -> &str {
        &self.essid
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn dns(&self) -> Option<&SpoofingResolver> {
        self.dns.as_ref()
    }

    pub fn http(&self) -> Option<&ProvisioningHttp> {
        self.http.as_ref()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// 启动：先用存储的凭据连接，失败再开启配网门户
    pub fn start(&mut self) -> anyhow::Result<PortalState> {
        // 先关掉 STA，保证重新连接时状态干净
        self.radio.set_station_active(false)?;

        if self.try_connect_from_store() {
            self.state = PortalState::Connected;
            log::info!("Connected with stored credentials at {}", self.local_address);
        } else {
            self.start_portal()?;
        }
        Ok(self.state)
    }

    fn try_connect_from_store(&mut self) -> bool {
        self.state = PortalState::TryingStoredCredentials;
        log::info!("Trying to load stored WiFi credentials");

        let credentials = match self.store.load() {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                log::info!("No stored credentials");
                return false;
            }
            Err(e) => {
                log::warn!("Invalid credentials record: {:#}", e);
                self.forget_stored();
                return false;
            }
        };

        if !self.connect_to_network(credentials) {
            log::info!("Connect with stored credentials failed, starting captive portal");
            self.forget_stored();
            return false;
        }
        true
    }

    fn forget_stored(&mut self) {
        if let Err(e) = self.store.remove() {
            log::error!("Failed to remove stored credentials: {:#}", e);
        }
    }

    /// 打开 STA 并轮询连接结果，期间阻塞，门户服务暂停处理。
    ///
    /// 成功时记录分配到的地址并持久化凭据；次数用尽则清掉内存中的凭据并关闭 STA。
    pub fn connect_to_network(&mut self, credentials: Credentials) -> bool {
        log::info!("Trying to connect to {:?}", credentials.ssid);
        self.connect_attempts = 0;

        let initiated = self
            .radio
            .set_station_active(true)
            .and_then(|_| self.radio.connect(&credentials));
        if let Err(e) = initiated {
            log::error!("Failed to start connecting to {:?}: {:#}", credentials.ssid, e);
        } else {
            while self.connect_attempts < self.config.max_connect_attempts {
                if self.radio.is_connected() {
                    return self.on_connected(credentials);
                }
                log::info!("Connection in progress");
                self.clock.sleep(self.config.connect_retry_delay());
                self.connect_attempts += 1;
            }
        }

        log::warn!(
            "Failed to connect to {:?} after {} attempts",
            credentials.ssid,
            self.connect_attempts
        );
        self.credentials = None;
        if let Err(e) = self.radio.set_station_active(false) {
            log::error!("Failed to turn off station interface: {:#}", e);
        }
        false
    }

    fn on_connected(&mut self, credentials: Credentials) -> bool {
        match self.radio.station_address() {
            Some(ip) => self.local_address = ip.to_string(),
            None => log::warn!("Connected but no address reported yet"),
        }
        log::info!(
            "Connected to {:?}, address {}",
            credentials.ssid,
            self.local_address
        );

        if let Err(e) = self.store.save(&credentials) {
            log::error!("Failed to persist credentials: {:#}", e);
        }
        self.credentials = Some(credentials);
        true
    }

    /// 进入配网门户：开启 AP，启动 DNS 和 HTTP 服务
    pub fn start_portal(&mut self) -> anyhow::Result<()> {
        log::info!("Starting captive portal");
        self.state = PortalState::PortalActive;
        self.local_address = self.config.ap_address.clone();
        self.start_access_point()?;

        if self.http.is_none() {
            self.http = Some(ProvisioningHttp::start(
                self.config.http_port,
                self.config.listen_backlog,
                &self.local_address,
                &self.config.www_dir,
                HTTP_TOKEN,
                &mut self.poller,
            )?);
            log::info!("Configured HTTP server");
        }
        if self.dns.is_none() {
            self.dns = Some(SpoofingResolver::start(
                self.config.dns_port,
                &self.local_address,
                self.config.dns_buffer_size,
                DNS_TOKEN,
                &mut self.poller,
            )?);
            log::info!("Configured DNS server");
        }
        Ok(())
    }

    fn start_access_point(&mut self) -> anyhow::Result<()> {
        let ap = AccessPointConfig {
            essid: self.essid.clone(),
            address: self.ap_address,
            netmask: parse_address(&self.config.ap_netmask)
                .map(Ipv4Addr::from)
                .unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
        };

        // 有时需要先关一次 AP 才能正常启动
        self.radio.set_access_point_active(false)?;
        self.radio.configure_access_point(&ap)?;

        let mut tries = 0;
        while !self.radio.is_access_point_active() {
            if tries >= self.config.max_connect_attempts {
                anyhow::bail!("Access point {:?} did not come up", ap.essid);
            }
            log::info!("Waiting for access point to turn on");
            self.radio.set_access_point_active(true)?;
            if self.radio.is_access_point_active() {
                break;
            }
            self.clock.sleep(AP_RETRY_DELAY);
            tries += 1;
        }

        log::info!("AP mode configured: {:?}", ap);
        Ok(())
    }

    /// 阻塞等待一轮事件并分发给所属服务
    pub fn poll_once(&mut self) -> std::io::Result<usize> {
        let mut events = std::mem::take(&mut self.events);
        let n = self.poller.poll(&mut events, self.config.poll_timeout())?;
        for event in &events {
            self.dispatch(event);
        }
        self.events = events;
        Ok(n)
    }

    fn dispatch(&mut self, event: &Event) {
        if let Some(dns) = self.dns.as_mut().filter(|d| d.is_running()) {
            if event.token == dns.token() {
                // UDP socket 上的挂断事件忽略
                if !event.readiness.is_hangup_only() {
                    dns.on_event(&mut self.poller, event);
                }
                return;
            }
        }
        if let Some(http) = self.http.as_mut() {
            http.on_event(&mut self.poller, event);
        }
    }

    /// 处理完事件后检查射频状态并推进状态机
    pub fn evaluate_radio(&mut self) {
        if !self.radio.is_connected() {
            if self.state == PortalState::CooldownRunning {
                log::warn!("Station link lost during cooldown");
                self.state = PortalState::PortalActive;
                self.cooldown_started = None;
            }

            let pending = self.http.as_ref().and_then(|http| http.staged().take());
            if let Some(credentials) = pending {
                log::info!("Credentials found, attempting to connect");
                self.connect_to_network(credentials);
            }
            return;
        }

        if !self.radio.is_access_point_active() {
            return;
        }

        match self.cooldown_started {
            None => {
                log::info!(
                    "Connection detected, turning AP off in {:?}",
                    self.config.ap_off_delay()
                );
                self.cooldown_started = Some(self.clock.now());
                self.state = PortalState::CooldownRunning;
            }
            Some(started) => {
                if self.clock.now().duration_since(started) >= self.config.ap_off_delay() {
                    self.finish_provisioning();
                }
            }
        }
    }

    /// 关闭 AP，HTTP 切换到状态页，停掉 DNS
    fn finish_provisioning(&mut self) {
        if let Err(e) = self.radio.set_access_point_active(false) {
            log::error!("Failed to turn off access point: {:#}", e);
            return;
        }
        log::info!("Access Point turned OFF");

        let network = self
            .credentials
            .as_ref()
            .map(|c| c.ssid.clone())
            .unwrap_or_default();
        if let Some(http) = self.http.as_mut() {
            http.adopt_connected_mode(&self.local_address, &network);
        }
        if let Some(dns) = self.dns.as_mut() {
            dns.stop(&mut self.poller);
        }
        self.state = PortalState::Connected;
    }

    /// 一次循环：等待事件、分发、推进状态
    pub fn tick(&mut self) {
        if let Err(e) = self.poll_once() {
            log::error!("Poll failed: {}", e);
            self.clock.sleep(self.config.poll_timeout());
        }
        self.evaluate_radio();
    }

    /// 运行主循环，直到外部中断
    pub fn run(&mut self, interrupted: &AtomicBool) {
        while !interrupted.load(Ordering::Relaxed) {
            self.tick();
        }
        log::info!("Captive portal stopped");
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        log::info!("Cleaning up");
        if let Some(dns) = self.dns.as_mut() {
            dns.stop(&mut self.poller);
        }
        if let Some(http) = self.http.as_mut() {
            http.stop(&mut self.poller);
        }
    }
}
