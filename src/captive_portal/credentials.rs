//! WiFi 凭据：登录页提交的待用凭据，以及连接成功后持久化的凭据

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Credentials {{ ssid: {:?}, password: [{} chars] }}",
            self.ssid,
            self.password.chars().count()
        )
    }
}

/// 登录处理器与编排器之间的单写单读槽位。
///
/// 后提交的凭据直接覆盖尚未取走的凭据；读取方用 [`StagedReader::take`] 取走，
/// 同一次提交只会被尝试连接一次。
pub fn staged_slot() -> (StagedWriter, StagedReader) {
    let slot = Rc::new(RefCell::new(None));
    (StagedWriter(slot.clone()), StagedReader(slot))
}

pub struct StagedWriter(Rc<RefCell<Option<Credentials>>>);

impl StagedWriter {
    pub fn stage(&self, credentials: Credentials) {
        if let Some(old) = self.0.borrow_mut().replace(credentials) {
            log::info!("Overwriting unread staged credentials for {:?}", old.ssid);
        }
    }
}

pub struct StagedReader(Rc<RefCell<Option<Credentials>>>);

impl StagedReader {
    pub fn take(&self) -> Option<Credentials> {
        self.0.borrow_mut().take()
    }

    pub fn is_pending(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// 持久化存储
pub trait CredentialStore {
    fn load(&mut self) -> anyhow::Result<Option<Credentials>>;
    fn save(&mut self, credentials: &Credentials) -> anyhow::Result<()>;
    fn remove(&mut self) -> anyhow::Result<()>;
}

/// 文件存储，内容为 JSON：`{"ssid":"..","password":".."}`
///
/// 旧固件写的 `<ssid>,<password>` 仍可读取，前提是正好能切成两段。
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn decode_record(raw: &[u8]) -> anyhow::Result<Credentials> {
    if let Ok(credentials) = serde_json::from_slice::<Credentials>(raw) {
        return Ok(credentials);
    }

    let fields: Vec<&[u8]> = raw.split(|b| *b == b',').collect();
    match fields.as_slice() {
        [ssid, password] => Ok(Credentials {
            ssid: std::str::from_utf8(ssid)?.to_string(),
            password: std::str::from_utf8(password)?.to_string(),
        }),
        _ => Err(anyhow::anyhow!(
            "Invalid credentials record ({} comma separated fields)",
            fields.len()
        )),
    }
}

pub fn encode_record(credentials: &Credentials) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(credentials)?)
}

impl CredentialStore for FileCredentialStore {
    fn load(&mut self) -> anyhow::Result<Option<Credentials>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("{} does not exist", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        decode_record(&raw).map(Some)
    }

    fn save(&mut self, credentials: &Credentials) -> anyhow::Result<()> {
        std::fs::write(&self.path, encode_record(credentials)?)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        log::info!("Wrote credentials to {}", self.path.display());
        Ok(())
    }

    fn remove(&mut self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// 设备上用 NVS 保存，键名与原固件的设置一致
#[cfg(target_os = "espidf")]
pub struct NvsCredentialStore {
    nvs: esp_idf_svc::nvs::EspDefaultNvs,
}

#[cfg(target_os = "espidf")]
impl NvsCredentialStore {
    pub fn new(nvs: esp_idf_svc::nvs::EspDefaultNvs) -> Self {
        Self { nvs }
    }
}

#[cfg(target_os = "espidf")]
impl CredentialStore for NvsCredentialStore {
    fn load(&mut self) -> anyhow::Result<Option<Credentials>> {
        let mut ssid_buf = [0; 64];
        let mut pass_buf = [0; 128];
        let ssid = self.nvs.get_str("ssid", &mut ssid_buf)?.map(str::to_string);
        let pass = self.nvs.get_str("pass", &mut pass_buf)?.map(str::to_string);
        match (ssid, pass) {
            (Some(ssid), Some(password)) if !ssid.is_empty() => {
                Ok(Some(Credentials { ssid, password }))
            }
            _ => Ok(None),
        }
    }

    fn save(&mut self, credentials: &Credentials) -> anyhow::Result<()> {
        self.nvs.set_str("ssid", &credentials.ssid)?;
        self.nvs.set_str("pass", &credentials.password)?;
        log::info!("Wrote credentials to NVS");
        Ok(())
    }

    fn remove(&mut self) -> anyhow::Result<()> {
        self.nvs.remove("ssid")?;
        self.nvs.remove("pass")?;
        Ok(())
    }
}
