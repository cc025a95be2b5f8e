//! Runtime settings of the orchestrator

use std::collections::BTreeMap;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Default RPC port
pub const DEFAULT_PORT: u16 = 8383;

/// Default gRPC port served by entrypoint containers
pub const DEFAULT_ENTRYPOINT_PORT: u16 = 9000;

/// Which cluster implementation to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Kubernetes API server from kubeconfig or in-cluster config
    #[default]
    Kube,
    /// In-process simulated cluster, pods become ready on their own
    Memory,
}

/// Complete settings file structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub cluster: ClusterSettings,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
    pub workloads: WorkloadSettings,
    pub ingress: IngressSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub backend: Backend,
    /// Namespace used when a request names none
    pub namespace: String,
    /// Field manager for server-side apply
    pub field_manager: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Kube,
            namespace: "default".to_string(),
            field_manager: "verso".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Upper bound of a WaitForVersionPods call
    pub readiness_secs: u64,
    /// Upper bound of a sync delete or restart
    pub sync_secs: u64,
    /// Poll interval of sync operations
    pub poll_interval_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            readiness_secs: 600,
            sync_secs: 120,
            poll_interval_ms: 1000,
        }
    }
}

impl TimeoutSettings {
    pub fn readiness(&self) -> Duration {
        Duration::from_secs(self.readiness_secs)
    }

    pub fn sync(&self) -> Duration {
        Duration::from_secs(self.sync_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per cluster call, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Mount paths and container settings shared by every workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSettings {
    pub pipeline_files_path: String,
    pub conf_path: String,
    pub log_path: String,
    pub entrypoint_port: u16,
    pub image_pull_policy: String,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            pipeline_files_path: "/pipeline".to_string(),
            conf_path: "/conf".to_string(),
            log_path: "/var/log/app".to_string(),
            entrypoint_port: DEFAULT_ENTRYPOINT_PORT,
            image_pull_policy: "IfNotPresent".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressSettings {
    /// Product hosts are `<product>.<base_domain>`
    pub base_domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub annotations: BTreeMap<String, String>,
    /// Secret holding the TLS certificate for product hosts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            base_domain: "verso.local".to_string(),
            class_name: None,
            annotations: BTreeMap::new(),
            tls_secret: None,
        }
    }
}

impl Settings {
    /// Reject settings no operation could run with
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".to_string());
        }
        if self.cluster.namespace.trim().is_empty() {
            return Err("cluster.namespace must not be empty".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.timeouts.readiness_secs == 0 || self.timeouts.sync_secs == 0 {
            return Err("timeouts must be non-zero".to_string());
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err("timeouts.poll_interval_ms must be non-zero".to_string());
        }
        if self.workloads.entrypoint_port == 0 {
            return Err("workloads.entrypoint_port must be non-zero".to_string());
        }
        Ok(())
    }
}
