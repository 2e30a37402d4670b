use crate::errors::Result;
use crate::metrics::DISPATCH_TOTAL;
use crate::model::Command;
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommand {
    pub device_id: Uuid,
    pub address: String,
    pub command: Command,
    pub duration_secs: Option<u64>,
}

/// Outcome of a dispatch attempt. Failures are reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Ok,
    Timeout,
    Unreachable(String),
    Rejected(u16),
}

impl DispatchResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, DispatchResult::Ok)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchResult::Ok => "ok",
            DispatchResult::Timeout => "timeout",
            DispatchResult::Unreachable(_) => "unreachable",
            DispatchResult::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for DispatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchResult::Ok => write!(f, "ok"),
            DispatchResult::Timeout => write!(f, "timeout"),
            DispatchResult::Unreachable(reason) => write!(f, "unreachable ({})", reason),
            DispatchResult::Rejected(status) => write!(f, "rejected with status {}", status),
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, command: &DeviceCommand) -> DispatchResult;
}

/// Sends commands as `GET /command` requests to the controller's HTTP server
pub struct HttpDispatcher {
    client: Client,
    default_port: u16,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration, default_port: u16) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            default_port,
        })
    }

    fn base_url(&self, address: &str) -> String {
        let host = address
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/');
        if host.contains(':') || self.default_port == 80 {
            format!("http://{}", host)
        } else {
            format!("http://{}:{}", host, self.default_port)
        }
    }

    fn command_url(&self, command: &DeviceCommand) -> String {
        let mut url = format!(
            "{}/command?device={}&cmd={}",
            self.base_url(&command.address),
            command.device_id,
            command.command.token()
        );
        if let Some(duration) = command.duration_secs {
            url.push_str(&format!("&duration={}", duration));
        }
        url
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, command: &DeviceCommand) -> DispatchResult {
        let url = self.command_url(command);
        debug!("Dispatching {}", url);

        let result = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => DispatchResult::Ok,
            Ok(response) => DispatchResult::Rejected(response.status().as_u16()),
            Err(e) if e.is_timeout() => DispatchResult::Timeout,
            Err(e) => DispatchResult::Unreachable(e.to_string()),
        };

        DISPATCH_TOTAL.with_label_values(&[result.label()]).inc();
        if !result.is_ok() {
            warn!(
                "Command {} for device {} at {} failed: {}",
                command.command.token(),
                command.device_id,
                command.address,
                result
            );
        }
        result
    }
}
