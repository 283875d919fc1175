//! WiFi 射频能力
//!
//! 编排器只通过 [`Radio`] 操作硬件：设备上是 `EspWifi`，开发机上是 [`HostRadio`]。

use std::net::Ipv4Addr;

use crate::captive_portal::credentials::Credentials;

#[cfg(target_os = "espidf")]
mod esp;
mod host;

#[cfg(target_os = "espidf")]
pub use esp::EspRadio;
pub use host::HostRadio;

/// AP 模式配置：地址同时作为网关和 DNS，开放网络
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub essid: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl AccessPointConfig {
    pub fn gateway(&self) -> Ipv4Addr {
        self.address
    }

    pub fn dns(&self) -> Ipv4Addr {
        self.address
    }
}

/// 子网掩码对应的前缀长度，非连续掩码返回 None
pub fn prefix_len(netmask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(netmask);
    (bits.leading_ones() == bits.count_ones()).then_some(bits.count_ones() as u8)
}

pub trait Radio {
    /// 打开/关闭 STA 模式
    fn set_station_active(&mut self, active: bool) -> anyhow::Result<()>;
    /// 发起连接，不等待结果
    fn connect(&mut self, credentials: &Credentials) -> anyhow::Result<()>;
    fn is_connected(&mut self) -> bool;
    /// STA 模式下分配到的地址
    fn station_address(&mut self) -> Option<Ipv4Addr>;

    fn set_access_point_active(&mut self, active: bool) -> anyhow::Result<()>;
    fn is_access_point_active(&mut self) -> bool;
    fn configure_access_point(&mut self, config: &AccessPointConfig) -> anyhow::Result<()>;

    /// 硬件地址，用于派生默认的 AP 名称
    fn hardware_id(&mut self) -> [u8; 6];
}

#[test]
fn test_prefix_len() {
    assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 0)), Some(24));
    assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 240, 0)), Some(20));
    assert_eq!(prefix_len(Ipv4Addr::UNSPECIFIED), Some(0));
    assert_eq!(prefix_len(Ipv4Addr::new(255, 0, 255, 0)), None);
}
