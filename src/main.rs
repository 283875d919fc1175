use std::sync::atomic::AtomicBool;

use wifi_portal::captive_portal::{PortalOrchestrator, SystemClock};
use wifi_portal::{PortalConfig, PortalState};

/// 外部中断标志，置位后主循环有序退出
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(not(target_os = "espidf"))]
extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, std::sync::atomic::Ordering::Relaxed);
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use wifi_portal::captive_portal::FileCredentialStore;
    use wifi_portal::radio::HostRadio;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    let config = PortalConfig::load()?;
    log::info!(
        "Portal address {}, DNS port {}, HTTP port {}",
        config.ap_address,
        config.dns_port,
        config.http_port
    );

    let radio = HostRadio::new(std::net::Ipv4Addr::LOCALHOST);
    let store = FileCredentialStore::new(&config.credentials_path);
    let mut portal = PortalOrchestrator::new(config, radio, store, SystemClock)?;

    if portal.start()? == PortalState::Connected {
        log::info!("Already provisioned, address {}", portal.local_address());
        return Ok(());
    }

    log::info!("Join {:?} and open any web page", portal.essid());
    portal.run(&INTERRUPTED);
    Ok(())
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::{EspDefaultNvs, EspDefaultNvsPartition};
    use wifi_portal::captive_portal::credentials::NvsCredentialStore;
    use wifi_portal::radio::EspRadio;

    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    let peripherals = esp_idf_svc::hal::prelude::Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let partition = EspDefaultNvsPartition::take()?;
    let nvs = EspDefaultNvs::new(partition.clone(), "wifi", true)?;

    let config = PortalConfig::default();
    config.validate()?;
    let ap_address = config.ap_address.parse()?;
    let ap_netmask = config.ap_netmask.parse()?;

    let radio = EspRadio::new(
        peripherals.modem,
        sysloop,
        Some(partition),
        ap_address,
        ap_netmask,
    )?;
    let store = NvsCredentialStore::new(nvs);
    let mut portal = PortalOrchestrator::new(config, radio, store, SystemClock)?;

    match portal.start()? {
        PortalState::Connected => {
            log::info!("WiFi ready, address {}", portal.local_address())
        }
        _ => log::info!("Captive portal running as {:?}", portal.essid()),
    }

    // 不能返回：`portal` 一旦释放，EspWifi 随之关闭，连接也就断了。
    // 门户已运行时继续服务，直接连上时只是空转保持连接
    portal.run(&INTERRUPTED);
    Ok(())
}
