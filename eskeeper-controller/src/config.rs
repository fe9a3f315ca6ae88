//! Command line configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use eskeeper_reconcile::{ControllerConfig, DeletionPolicy};

/// What to do with a resource being deleted while its cluster is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeletionPolicyArg {
    /// Drop the finalizer and possibly leak the remote object
    ForceRemove,
    /// Keep retrying until the cluster answers
    RetainUntilReachable,
}

impl From<DeletionPolicyArg> for DeletionPolicy {
    fn from(arg: DeletionPolicyArg) -> Self {
        match arg {
            DeletionPolicyArg::ForceRemove => DeletionPolicy::ForceRemoveWhenUnreachable,
            DeletionPolicyArg::RetainUntilReachable => DeletionPolicy::RetainUntilReachable,
        }
    }
}

/// eskeeper controller
#[derive(Parser, Debug)]
#[command(name = "eskeeper-controller", version, about)]
pub struct Args {
    /// Directory with resource manifests (.yaml, .yml, .json)
    #[arg(long, default_value = "/etc/eskeeper/manifests")]
    pub manifest_dir: PathBuf,

    /// Directory with credential secrets, one subdirectory per secret
    #[arg(long, default_value = "/etc/eskeeper/secrets")]
    pub secrets_dir: PathBuf,

    /// YAML file listing the managed clusters
    #[arg(long, default_value = "/etc/eskeeper/clusters.yaml")]
    pub cluster_registry: PathBuf,

    /// Directory holding declared resources and their status across restarts
    #[arg(long, default_value = "/var/lib/eskeeper")]
    pub state_dir: PathBuf,

    /// Manifest directory poll interval in seconds
    #[arg(long, default_value = "10")]
    pub poll_interval: u64,

    /// Reconcile passes running at the same time, per resource kind
    #[arg(long, default_value = "4")]
    pub max_concurrent_reconciles: usize,

    /// Elasticsearch request timeout in seconds
    #[arg(long, default_value = "30")]
    pub request_timeout: u64,

    /// Re-check converged resources every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    pub resync_interval: u64,

    /// Deletion behavior when a cluster is unreachable
    #[arg(long, value_enum, default_value = "force-remove")]
    pub deletion_policy: DeletionPolicyArg,
}

impl Args {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_concurrent_reconciles: self.max_concurrent_reconciles.max(1),
            resync_interval: (self.resync_interval > 0)
                .then(|| Duration::from_secs(self.resync_interval)),
            deletion_policy: self.deletion_policy.into(),
            ..ControllerConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }
}
