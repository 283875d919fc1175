//! 配网门户配置
//!
//! 配置文件为可选的 JSON 文件，缺省字段使用默认值。

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::captive_portal::dns::parse_address;
use crate::radio::prefix_len;

/// AP 模式的默认 IP 地址
pub const DEFAULT_AP_ADDRESS: &str = "192.168.4.1";

/// 编译期可注入的默认 AP 名称前缀
static DEFAULT_ESSID_PREFIX: Option<&str> = std::option_env!("PORTAL_ESSID_PREFIX");

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// AP 地址，同时作为网关和 DNS
    pub ap_address: String,
    pub ap_netmask: String,
    /// AP 名称，为空时由硬件地址派生
    pub essid: Option<String>,
    pub essid_prefix: String,

    pub dns_port: u16,
    pub http_port: u16,
    pub listen_backlog: i32,
    pub dns_buffer_size: usize,

    /// 静态页面目录
    pub www_dir: PathBuf,
    pub credentials_path: PathBuf,

    pub max_connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    pub ap_off_delay_ms: u64,
    pub poll_timeout_ms: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            ap_address: DEFAULT_AP_ADDRESS.to_string(),
            ap_netmask: "255.255.255.0".to_string(),
            essid: None,
            essid_prefix: DEFAULT_ESSID_PREFIX.unwrap_or("Portal").to_string(),
            dns_port: 53,
            http_port: 80,
            listen_backlog: 5,
            dns_buffer_size: 512,
            www_dir: PathBuf::from("./www"),
            credentials_path: PathBuf::from("./wifi.creds"),
            max_connect_attempts: 10,
            connect_retry_delay_ms: 2000,
            ap_off_delay_ms: 60 * 1000,
            poll_timeout_ms: 1000,
        }
    }
}

impl PortalConfig {
    /// 从 JSON 文件加载配置
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: PortalConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 按命令行参数、`PORTAL_CONFIG` 环境变量的顺序查找配置文件，都没有则使用默认值
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("PORTAL_CONFIG").ok());

        match path {
            Some(path) => {
                log::info!("Loading config from {}", path);
                Self::from_file(Path::new(&path))
            }
            None => {
                log::info!("No config file given, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        parse_address(&self.ap_address)
            .map_err(|e| anyhow::anyhow!("Invalid ap_address {:?}: {}", self.ap_address, e))?;
        let netmask = parse_address(&self.ap_netmask)
            .map_err(|e| anyhow::anyhow!("Invalid ap_netmask {:?}: {}", self.ap_netmask, e))?;
        if prefix_len(Ipv4Addr::from(netmask)).is_none() {
            anyhow::bail!("ap_netmask {:?} is not contiguous", self.ap_netmask);
        }
        if self.max_connect_attempts == 0 {
            anyhow::bail!("max_connect_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn ap_off_delay(&self) -> Duration {
        Duration::from_millis(self.ap_off_delay_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// 未配置 AP 名称时，取硬件地址后 3 字节（6 位十六进制）作为后缀
    pub fn essid_for(&self, hardware_id: &[u8; 6]) -> String {
        match &self.essid {
            Some(essid) if !essid.is_empty() => essid.clone(),
            _ => format!(
                "{}-{:02x}{:02x}{:02x}",
                self.essid_prefix, hardware_id[3], hardware_id[4], hardware_id[5]
            ),
        }
    }
}

#[test]
fn test_partial_config_uses_defaults() {
    let config: PortalConfig =
        serde_json::from_str(r#"{"ap_address":"10.0.0.1","http_port":8080}"#).unwrap();
    assert_eq!(config.ap_address, "10.0.0.1");
    assert_eq!(config.http_port, 8080);
    assert_eq!(config.dns_port, 53);
    assert_eq!(config.max_connect_attempts, 10);
    assert_eq!(config.ap_off_delay(), Duration::from_secs(60));
    config.validate().unwrap();
}

#[test]
fn test_invalid_address_rejected() {
    let config = PortalConfig {
        ap_address: "192.168.4.256".to_string(),
        ..Default::default()
    };
    assert!(config.validate().is_err());

    let config = PortalConfig {
        ap_netmask: "255.0.255.0".to_string(),
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_essid_derived_from_hardware_id() {
    let config = PortalConfig {
        essid_prefix: "Pico".to_string(),
        ..Default::default()
    };
    let mac = [0x28, 0xcd, 0xc1, 0x0a, 0xb2, 0x3f];
    assert_eq!(config.essid_for(&mac), "Pico-0ab23f");

    let named = PortalConfig {
        essid: Some("Kitchen".to_string()),
        ..Default::default()
    };
    assert_eq!(named.essid_for(&mac), "Kitchen");
}
