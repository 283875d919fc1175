//! 内嵌 HTML 模板
//!
//! 登录页源文件是 `www/index.html`：开发机上直接读文件，设备上没有文件系统，
//! 编译时内嵌。连接成功后的状态页由这里渲染。

pub const INDEX_HTML: &str = include_str!("../../www/index.html");

pub const CONNECTED_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Connected</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            background: #1a1a2e;
            color: #eee;
            padding: 20px;
        }
        .container { max-width: 400px; margin: 0 auto; }
        h1 { color: #00d4ff; font-size: 24px; margin-bottom: 16px; }
        code { color: #00d4ff; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Connected</h1>
        <p>The device joined <code>{ssid}</code>.</p>
        <p>It is now reachable at <code>http://{ip}/</code>.</p>
        <p>The setup network will shut down shortly; reconnect to your usual WiFi.</p>
    </div>
</body>
</html>
"#;

pub fn render_connected(ssid: &str, ip: &str) -> String {
    CONNECTED_HTML
        .replace("{ssid}", &escape(ssid))
        .replace("{ip}", &escape(ip))
}

/// SSID 来自用户输入，插入页面前转义
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[test]
fn test_render_connected_escapes_ssid() {
    let page = render_connected("<b>Home</b>", "10.0.0.23");
    assert!(page.contains("&lt;b&gt;Home&lt;/b&gt;"));
    assert!(page.contains("http://10.0.0.23/"));
    assert!(!page.contains("{ssid}"));
}
