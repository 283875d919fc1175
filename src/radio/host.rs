use std::net::Ipv4Addr;

use crate::captive_portal::credentials::Credentials;

use super::{AccessPointConfig, Radio};

/// 开发机上没有真实射频：AP 随开随用，任何凭据都能连上，
/// 连上后使用配置的本机地址。用于在电脑上跑通整个配网流程。
pub struct HostRadio {
    station_address: Ipv4Addr,
    hardware_id: [u8; 6],
    station_active: bool,
    connected: bool,
    ap_active: bool,
    ap_config: Option<AccessPointConfig>,
}

impl HostRadio {
    pub fn new(station_address: Ipv4Addr) -> Self {
        Self {
            station_address,
            hardware_id: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            station_active: false,
            connected: false,
            ap_active: false,
            ap_config: None,
        }
    }

    pub fn access_point_config(&self) -> Option<&AccessPointConfig> {
        self.ap_config.as_ref()
    }
}

impl Radio for HostRadio {
    fn set_station_active(&mut self, active: bool) -> anyhow::Result<()> {
        self.station_active = active;
        if !active {
            self.connected = false;
        }
        Ok(())
    }

    fn connect(&mut self, credentials: &Credentials) -> anyhow::Result<()> {
        if !self.station_active {
            anyhow::bail!("station interface is not active");
        }
        log::info!("Host radio pretending to join {:?}", credentials.ssid);
        self.connected = true;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.station_active && self.connected
    }

    fn station_address(&mut self) -> Option<Ipv4Addr> {
        self.is_connected().then_some(self.station_address)
    }

    fn set_access_point_active(&mut self, active: bool) -> anyhow::Result<()> {
        self.ap_active = active;
        Ok(())
    }

    fn is_access_point_active(&mut self) -> bool {
        self.ap_active
    }

    fn configure_access_point(&mut self, config: &AccessPointConfig) -> anyhow::Result<()> {
        log::info!(
            "Host radio AP {:?} at {}/{}",
            config.essid,
            config.address,
            config.netmask
        );
        self.ap_config = Some(config.clone());
        Ok(())
    }

    fn hardware_id(&mut self) -> [u8; 6] {
        self.hardware_id
    }
}

#[test]
fn test_host_radio_connects_only_when_station_active() {
    let mut radio = HostRadio::new(Ipv4Addr::new(10, 0, 0, 23));
    let creds = Credentials::new("home", "secret");
    assert!(radio.connect(&creds).is_err());

    radio.set_station_active(true).unwrap();
    radio.connect(&creds).unwrap();
    assert!(radio.is_connected());
    assert_eq!(radio.station_address(), Some(Ipv4Addr::new(10, 0, 0, 23)));

    radio.set_station_active(false).unwrap();
    assert!(!radio.is_connected());
    assert_eq!(radio.station_address(), None);

    assert!(radio.access_point_config().is_none());
    let ap = AccessPointConfig {
        essid: "Portal-000001".to_string(),
        address: Ipv4Addr::new(192, 168, 4, 1),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
    };
    radio.configure_access_point(&ap).unwrap();
    assert_eq!(radio.access_point_config(), Some(&ap));
}
