//! SoftAP + Web 配网模块
//!
//! DNS 劫持 + 极简 HTTP 服务 + 射频状态机，全部跑在同一个单线程轮询循环里。

pub mod credentials;
pub mod dns;
pub mod handlers;
mod html;
pub mod listener;
pub mod orchestrator;
pub mod request;
pub mod server;

pub use credentials::{CredentialStore, Credentials, FileCredentialStore};
pub use dns::SpoofingResolver;
pub use orchestrator::{Clock, PortalOrchestrator, PortalState, SystemClock};
pub use server::ProvisioningHttp;
