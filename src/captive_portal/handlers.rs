//! HTTP 路由表

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::credentials::{Credentials, StagedWriter};
use super::html;
use super::request::QueryParams;

pub const OK_HEAD: &str = "HTTP/1.1 200 OK\r\n";
pub const NOT_FOUND_HEAD: &str = "HTTP/1.1 404 Not Found\r\n";

/// 处理器的返回值，缺省的部分由服务补上（空响应体、200 OK）
#[derive(Debug, Default)]
pub struct Reply {
    pub body: Option<Vec<u8>>,
    pub head: Option<String>,
}

impl Reply {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into().into_bytes()),
            head: Some(format!("{}Content-Type: text/html\r\n", OK_HEAD)),
        }
    }

    pub fn redirect(address: &str) -> Self {
        Self {
            body: None,
            head: Some(redirect_head(address)),
        }
    }
}

pub fn redirect_head(address: &str) -> String {
    format!(
        "HTTP/1.1 307 Temporary Redirect\r\nLocation: http://{}/\r\n",
        address
    )
}

/// 处理器执行时能看到的服务状态
pub struct RouteContext<'a> {
    pub address: &'a str,
    pub network: Option<&'a str>,
}

pub type Handler = Box<dyn Fn(&RouteContext<'_>, &QueryParams) -> Reply>;

pub enum Route {
    StaticFile(PathBuf),
    /// 编译进固件的页面
    Embedded(&'static [u8]),
    Handler(Handler),
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::StaticFile(path) => write!(f, "Route::StaticFile({})", path.display()),
            Route::Embedded(page) => write!(f, "Route::Embedded({} bytes)", page.len()),
            Route::Handler(_) => write!(f, "Route::Handler"),
        }
    }
}

pub type RouteTable = HashMap<String, Route>;

/// 配网阶段：登录页 + 提交凭据
pub fn provisioning_routes(www_dir: &Path, staged: StagedWriter) -> RouteTable {
    let mut routes = RouteTable::new();
    routes.insert("/".to_string(), login_page(www_dir));
    routes.insert(
        "/login".to_string(),
        Route::Handler(Box::new(move |ctx, params| login(&staged, ctx, params))),
    );
    routes
}

#[cfg(not(target_os = "espidf"))]
fn login_page(www_dir: &Path) -> Route {
    Route::StaticFile(www_dir.join("index.html"))
}

/// 设备上不挂载文件系统，登录页用内嵌的副本
#[cfg(target_os = "espidf")]
fn login_page(_www_dir: &Path) -> Route {
    embedded_login_page()
}

pub fn embedded_login_page() -> Route {
    Route::Embedded(html::INDEX_HTML.as_bytes())
}

/// 连接成功后只剩一个状态页
pub fn connected_routes() -> RouteTable {
    let mut routes = RouteTable::new();
    routes.insert("/".to_string(), Route::Handler(Box::new(connected)));
    routes
}

/// ssid 与 password 都存在才暂存；无论结果如何都重定向回首页，
/// 成功与否由之后的连接结果体现
pub fn login(staged: &StagedWriter, ctx: &RouteContext<'_>, params: &QueryParams) -> Reply {
    match (params.get("ssid"), params.get("password")) {
        (Some(ssid), Some(password)) if !ssid.is_empty() => {
            log::info!("Login submitted for {:?}", ssid);
            staged.stage(Credentials::new(ssid.as_str(), password.as_str()));
        }
        _ => log::warn!("Login request without ssid/password, ignoring"),
    }
    Reply::redirect(ctx.address)
}

fn connected(ctx: &RouteContext<'_>, _params: &QueryParams) -> Reply {
    Reply::html(html::render_connected(
        ctx.network.unwrap_or_default(),
        ctx.address,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captive_portal::credentials::staged_slot;
    use crate::captive_portal::request::parse_query;

    const CTX: RouteContext<'static> = RouteContext {
        address: "192.168.4.1",
        network: None,
    };

    #[test]
    fn test_login_stages_credentials() {
        let (writer, reader) = staged_slot();
        let reply = login(&writer, &CTX, &parse_query("ssid=home&password=secret"));
        assert_eq!(
            reply.head.as_deref(),
            Some("HTTP/1.1 307 Temporary Redirect\r\nLocation: http://192.168.4.1/\r\n")
        );
        assert!(reply.body.is_none());
        assert_eq!(reader.take(), Some(Credentials::new("home", "secret")));
    }

    #[test]
    fn test_login_missing_field_leaves_slot_unchanged() {
        let (writer, reader) = staged_slot();
        writer.stage(Credentials::new("old", "pass"));

        let reply = login(&writer, &CTX, &parse_query("ssid=home"));
        assert!(reply.head.unwrap().starts_with("HTTP/1.1 307"));
        let reply = login(&writer, &CTX, &parse_query("password=secret"));
        assert!(reply.head.unwrap().starts_with("HTTP/1.1 307"));

        assert_eq!(reader.take(), Some(Credentials::new("old", "pass")));
    }

    #[test]
    fn test_route_tables() {
        let (writer, _reader) = staged_slot();
        let routes = provisioning_routes(Path::new("/www"), writer);
        assert!(matches!(routes.get("/"), Some(Route::StaticFile(p)) if p == Path::new("/www/index.html")));
        assert!(matches!(routes.get("/login"), Some(Route::Handler(_))));

        match embedded_login_page() {
            Route::Embedded(page) => {
                let page = std::str::from_utf8(page).unwrap();
                assert!(page.contains("action=\"/login\""));
                assert!(page.contains("name=\"ssid\""));
                assert!(page.contains("name=\"password\""));
            }
            other => panic!("unexpected route {:?}", other),
        }

        let routes = connected_routes();
        assert_eq!(routes.len(), 1);
        assert!(routes.get("/login").is_none());
    }
}
