//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__SERVER__DEV_MODE=true`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::ConnectorError;

/// API Key 的兜底环境变量（未在配置中设置 client.api_key 时读取）
pub const API_KEY_ENV: &str = "BEE_API_KEY";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// [server] 段：服务端地址与路径
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_url")]
    pub url: String,
    /// dev_mode 打开时使用的本地地址
    #[serde(default = "default_dev_url")]
    pub dev_url: String,
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// 换取 session token 的登录路径
    #[serde(default = "default_auth_path")]
    pub auth_path: String,
    /// WebSocket 事件通道路径
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_server_url() -> String {
    "https://api-service-bofkvbi4va-ey.a.run.app".to_string()
}

fn default_dev_url() -> String {
    "http://localhost:8082".to_string()
}

fn default_api_version() -> String {
    "/v1".to_string()
}

fn default_auth_path() -> String {
    "/signin/".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            dev_url: default_dev_url(),
            dev_mode: false,
            api_version: default_api_version(),
            auth_path: default_auth_path(),
            ws_path: default_ws_path(),
        }
    }
}

impl ServerSection {
    /// 当前生效的 HTTP 基地址（dev_mode 时为本地地址），不带末尾斜杠
    pub fn base_url(&self) -> &str {
        let url = if self.dev_mode { &self.dev_url } else { &self.url };
        url.trim_end_matches('/')
    }

    /// 登录端点，如 https://host/v1/signin/
    pub fn auth_url(&self) -> String {
        format!("{}{}{}", self.base_url(), self.api_version, self.auth_path)
    }

    /// WebSocket 地址：http -> ws，https -> wss
    pub fn ws_url(&self) -> String {
        let base = self.base_url();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{}{}", ws_base, self.ws_path)
    }
}

/// [client] 段：凭证
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClientSection {
    pub api_key: Option<String>,
}

/// [connection] 段：重连间隔、嵌套调用超时、REST 重试次数
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSection {
    /// 断线后重连前的固定等待（秒），无抖动、无上限次数
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// invoke 等待结果的超时（秒）；0 表示一直等到结果到达或连接关闭
    #[serde(default)]
    pub invoke_timeout_secs: u64,
    /// REST 调用遇到 502/503/504 时的最大重试次数
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_request_retries() -> u32 {
    5
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            invoke_timeout_secs: 0,
            request_retries: default_request_retries(),
        }
    }
}

impl ConnectionSection {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn invoke_timeout(&self) -> Option<Duration> {
        (self.invoke_timeout_secs > 0).then(|| Duration::from_secs(self.invoke_timeout_secs))
    }
}

/// [runtime] 段：执行模型
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeSection {
    #[serde(default)]
    pub flavor: RuntimeFlavor,
    /// multi_thread 时的工作线程数，未设置则由 tokio 决定
    pub worker_threads: Option<usize>,
}

/// 执行模型：单线程协作式 / 多线程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeFlavor {
    CurrentThread,
    #[default]
    MultiThread,
}

impl AppConfig {
    /// 解析 API Key：配置优先，其次 BEE_API_KEY 环境变量
    pub fn api_key(&self) -> Result<String, ConnectorError> {
        self.client
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()))
            .ok_or_else(|| ConnectorError::Config("api_key is required".to_string()))
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
