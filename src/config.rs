//! Job parameters supplied by the collaborator, and the HTTP client built from them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{redirect, Client, Proxy, RequestBuilder};
use url::Url;

use crate::error::Result;

pub const DEFAULT_WORKER_COUNT: usize = 8;
pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_USER_AGENT: &str = concat!("rsdl/", env!("CARGO_PKG_VERSION"));

/// Everything needed to run one segmented download.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub url: Url,
    pub destination_path: PathBuf,
    /// Directory for per-segment sinks. Defaults to the destination's parent.
    pub temp_directory: Option<PathBuf>,
    pub worker_count: usize,
    pub username: Option<String>,
    pub password: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    /// How many times a failed segment is relaunched before the job fails.
    pub max_segment_retries: u32,
    pub max_redirects: usize,
    /// Idle limit between two body chunks of a segment.
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl JobRequest {
    pub fn new(url: Url, destination_path: impl Into<PathBuf>) -> Self {
        Self {
            url,
            destination_path: destination_path.into(),
            temp_directory: None,
            worker_count: DEFAULT_WORKER_COUNT,
            username: None,
            password: None,
            proxy_host: None,
            proxy_port: None,
            max_segment_retries: 0,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            read_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_host = Some(host.into());
        self.proxy_port = Some(port);
        self
    }

    pub fn with_temp_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_directory = Some(dir.into());
        self
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match &self.username {
            Some(user) if !user.is_empty() => Some(Credentials {
                username: user.clone(),
                password: self.password.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }

    pub fn proxy(&self) -> Option<ProxySettings> {
        match (&self.proxy_host, self.proxy_port) {
            (Some(host), Some(port)) if !host.is_empty() && port != 0 => Some(ProxySettings {
                host: host.clone(),
                port,
            }),
            _ => None,
        }
    }

    /// Directory holding the per-segment sinks.
    pub fn sink_directory(&self) -> PathBuf {
        if let Some(dir) = &self.temp_directory {
            return dir.clone();
        }
        match self.destination_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Adds `Authorization: Basic <base64(user:password)>` to a request.
    pub(crate) fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }
}

pub(crate) fn authorize(request: RequestBuilder, credentials: Option<&Credentials>) -> RequestBuilder {
    match credentials {
        Some(c) => c.authorize(request),
        None => request,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
}

impl ProxySettings {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Builds the client shared by the probe and every segment worker.
///
/// Redirects are never followed here: a 3xx must reach the coordinator so the
/// whole job restarts against the new location.
pub fn build_client(request: &JobRequest) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(request.user_agent.as_str())
        .connect_timeout(request.connect_timeout)
        .redirect(redirect::Policy::none());

    if let Some(proxy) = request.proxy() {
        builder = builder.proxy(Proxy::all(proxy.url())?);
    }

    Ok(builder.build()?)
}
