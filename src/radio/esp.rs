//! ESP-IDF 上的射频实现

use std::net::Ipv4Addr;

use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::modem::Modem,
    ipv4::{self, Mask, Subnet},
    netif::{EspNetif, NetifConfiguration, NetifStack},
    nvs::EspDefaultNvsPartition,
    wifi::{
        AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration as WifiConfig,
        EspWifi, WifiDriver,
    },
};

use crate::captive_portal::credentials::Credentials;

use super::{prefix_len, AccessPointConfig, Radio};

pub struct EspRadio {
    wifi: EspWifi<'static>,
    ap_address: Ipv4Addr,
    ap_netmask: Ipv4Addr,
    client: Option<ClientConfiguration>,
    access_point: Option<AccessPointConfiguration>,
    station_active: bool,
    ap_active: bool,
}

impl EspRadio {
    /// AP 的 IP 配置在 netif 创建时固定，之后只能改名称
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
        ap_address: Ipv4Addr,
        ap_netmask: Ipv4Addr,
    ) -> anyhow::Result<Self> {
        let mask = prefix_len(ap_netmask)
            .ok_or_else(|| anyhow::anyhow!("Invalid AP netmask {}", ap_netmask))?;
        let ap_netif_config = NetifConfiguration {
            ip_configuration: Some(ipv4::Configuration::Router(ipv4::RouterConfiguration {
                subnet: Subnet {
                    gateway: ap_address,
                    mask: Mask(mask),
                },
                dhcp_enabled: true,
                dns: Some(ap_address),
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        };
        let ap_netif = EspNetif::new_with_conf(&ap_netif_config)?;
        let sta_netif = EspNetif::new(NetifStack::Sta)?;

        let driver = WifiDriver::new(modem, sysloop, nvs)?;
        let wifi = EspWifi::wrap_all(driver, sta_netif, ap_netif)?;

        Ok(Self {
            wifi,
            ap_address,
            ap_netmask,
            client: None,
            access_point: None,
            station_active: false,
            ap_active: false,
        })
    }

    /// 按当前开关组合下发配置：STA、AP、两者同时（Mixed）或全部关闭
    fn apply(&mut self) -> anyhow::Result<()> {
        let client = self.client.clone().unwrap_or_default();
        let ap = self.access_point.clone().unwrap_or_default();

        let config = match (self.station_active, self.ap_active) {
            (false, false) => {
                if self.wifi.is_started()? {
                    self.wifi.stop()?;
                }
                return Ok(());
            }
            (true, false) => WifiConfig::Client(client),
            (false, true) => WifiConfig::AccessPoint(ap),
            (true, true) => WifiConfig::Mixed(client, ap),
        };

        self.wifi.set_configuration(&config)?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }
}

impl Radio for EspRadio {
    fn set_station_active(&mut self, active: bool) -> anyhow::Result<()> {
        if !active && self.station_active && self.wifi.is_connected().unwrap_or(false) {
            self.wifi.disconnect()?;
        }
        self.station_active = active;
        self.apply()
    }

    fn connect(&mut self, credentials: &Credentials) -> anyhow::Result<()> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        self.client = Some(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("SSID too long: {:?}", credentials.ssid))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Password too long"))?,
            auth_method,
            ..Default::default()
        });
        self.station_active = true;
        self.apply()?;
        self.wifi.connect()?;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.station_active && self.wifi.is_connected().unwrap_or(false)
    }

    fn station_address(&mut self) -> Option<Ipv4Addr> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }

    fn set_access_point_active(&mut self, active: bool) -> anyhow::Result<()> {
        self.ap_active = active;
        self.apply()
    }

    fn is_access_point_active(&mut self) -> bool {
        self.ap_active && self.wifi.is_started().unwrap_or(false)
    }

    fn configure_access_point(&mut self, config: &AccessPointConfig) -> anyhow::Result<()> {
        if config.address != self.ap_address {
            log::warn!(
                "AP address {} differs from netif address {}, keeping the latter",
                config.address,
                self.ap_address
            );
        }
        if config.netmask != self.ap_netmask {
            log::warn!(
                "AP netmask {} differs from netif netmask {}, keeping the latter",
                config.netmask,
                self.ap_netmask
            );
        }
        self.access_point = Some(AccessPointConfiguration {
            ssid: config
                .essid
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("AP name too long: {:?}", config.essid))?,
            ssid_hidden: false,
            channel: 1,
            auth_method: AuthMethod::None,
            max_connections: 4,
            ..Default::default()
        });
        self.apply()
    }

    fn hardware_id(&mut self) -> [u8; 6] {
        self.wifi.ap_netif().get_mac().unwrap_or_default()
    }
}
