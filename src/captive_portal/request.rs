//! HTTP 请求解析，只支持以空行结束、没有请求体的请求

use std::collections::HashMap;

pub type QueryParams = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    NotUtf8,
    /// 请求行不是 `METHOD TARGET VERSION`
    MalformedRequestLine(String),
    MissingHost,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::NotUtf8 => write!(f, "request is not valid UTF-8"),
            RequestError::MalformedRequestLine(line) => {
                write!(f, "malformed request line {:?}", line)
            }
            RequestError::MissingHost => write!(f, "Host header missing"),
        }
    }
}

impl std::error::Error for RequestError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub params: QueryParams,
    pub host: String,
}

impl HttpRequest {
    /// 解析失败时使用的哨兵请求，Host 为空，永远不会通过路由校验
    pub fn invalid() -> Self {
        Self {
            method: "INVALID".to_string(),
            path: "/".to_string(),
            params: QueryParams::new(),
            host: String::new(),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.host.is_empty()
    }

    pub fn parse(raw: &[u8]) -> Result<Self, RequestError> {
        let text = std::str::from_utf8(raw).map_err(|_| RequestError::NotUtf8)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split(' ').collect();
        let [method, target, _version] = parts.as_slice() else {
            return Err(RequestError::MalformedRequestLine(request_line.to_string()));
        };
        if method.is_empty() || target.is_empty() {
            return Err(RequestError::MalformedRequestLine(request_line.to_string()));
        }

        let (path, query) = target.split_once('?').unwrap_or((*target, ""));
        let params = parse_query(query);

        let host = lines
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("host")
                    .then(|| value.trim().to_string())
            })
            .filter(|host| !host.is_empty())
            .ok_or(RequestError::MissingHost)?;

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            params,
            host,
        })
    }
}

/// `a=1&b=2`，重复的键以最后一个为准，没有 `=` 的片段忽略
pub fn parse_query(query: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            params.insert(form_decode(key), form_decode(value));
        }
    }
    params
}

/// 表单编码解码：`+` 为空格，`%XX` 为字节，非法转义原样保留
pub fn form_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_login_request() {
        let raw = b"GET /login?ssid=Home+Net&password=p%40ss%2C1 HTTP/1.1\r\nHost: 192.168.4.1\r\nAccept: */*\r\n\r\n";
        let req = HttpRequest::parse(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/login");
        assert_eq!(req.host, "192.168.4.1");
        assert_eq!(req.params.get("ssid").map(String::as_str), Some("Home Net"));
        assert_eq!(
            req.params.get("password").map(String::as_str),
            Some("p@ss,1")
        );
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let params = parse_query("a=1&b=2&a=3&flag");
        assert_eq!(params.len(), 2);
        assert_eq!(params["a"], "3");
        assert_eq!(params["b"], "2");
    }

    #[test]
    fn test_host_header_case_insensitive() {
        let req = HttpRequest::parse(b"GET / HTTP/1.1\r\nhOsT:example.com\r\n\r\n").unwrap();
        assert_eq!(req.host, "example.com");
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(
            HttpRequest::parse(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"),
            Err(RequestError::MissingHost)
        );
        assert!(matches!(
            HttpRequest::parse(b"GARBAGE\r\nHost: a\r\n\r\n"),
            Err(RequestError::MalformedRequestLine(_))
        ));
        assert_eq!(
            HttpRequest::parse(b"GET /\xff HTTP/1.1\r\n\r\n"),
            Err(RequestError::NotUtf8)
        );
        assert!(HttpRequest::invalid().is_invalid());
    }

    #[test]
    fn test_form_decode_bad_escapes() {
        assert_eq!(form_decode("100%"), "100%");
        assert_eq!(form_decode("%zz"), "%zz");
        assert_eq!(form_decode("%41%42"), "AB");
        assert_eq!(form_decode("%+f"), "% f");
    }
}
