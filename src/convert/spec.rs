//! Execution spec derivation.
//!
//! Turns an image configuration into the OCI runtime spec the sandboxed
//! runtime boots with. Arguments are the image's entrypoint followed by its
//! command; environment entries override the default `PATH` by key.

use crate::constants::{DEFAULT_PATH_ENV, OCI_RUNTIME_SPEC_VERSION, SANDBOX_ROOTFS_PATH};
use crate::oci::ImageConfiguration;
use serde::{Deserialize, Serialize};

/// OCI runtime spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSpec {
    pub oci_version: String,
    pub root: ExecRoot,
    pub process: ExecProcess,
    pub hostname: String,
    pub mounts: Vec<ExecMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<ExecLinux>,
}

/// Root filesystem location inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Process to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProcess {
    pub terminal: bool,
    pub user: ExecUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecLinux {
    pub namespaces: Vec<ExecNamespace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
}

/// Derives the execution spec of an image.
pub fn derive(image: &ImageConfiguration) -> ExecSpec {
    let config = image.config.clone().unwrap_or_default();

    let mut args = config.entrypoint.unwrap_or_default();
    if let Some(cmd) = config.cmd {
        args.extend(cmd);
    }

    let cwd = match config.working_dir {
        Some(dir) if !dir.is_empty() => dir,
        _ => "/".to_string(),
    };

    ExecSpec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
        root: ExecRoot {
            path: SANDBOX_ROOTFS_PATH.to_string(),
            readonly: false,
        },
        process: ExecProcess {
            terminal: true,
            user: ExecUser { uid: 0, gid: 0 },
            args,
            env: merge_env(&[DEFAULT_PATH_ENV.to_string()], &config.env.unwrap_or_default()),
            cwd,
        },
        hostname: String::new(),
        mounts: default_mounts(),
        // The network namespace is shared with the sandbox's virtual NIC.
        linux: Some(ExecLinux {
            namespaces: ["pid", "ipc", "uts", "mount"]
                .into_iter()
                .map(|ns| ExecNamespace {
                    ns_type: ns.to_string(),
                })
                .collect(),
        }),
    }
}

/// Replaces entries of `base` by key, appending new keys in order.
fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let key = |entry: &str| entry.split_once('=').map_or(entry, |(k, _)| k).to_string();

    let mut merged: Vec<String> = base.to_vec();
    for entry in overrides {
        let k = key(entry);
        match merged.iter_mut().find(|e| key(e) == k) {
            Some(existing) => *existing = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

fn default_mounts() -> Vec<ExecMount> {
    let mount = |destination: &str, mount_type: &str, options: &[&str]| ExecMount {
        destination: destination.to_string(),
        mount_type: mount_type.to_string(),
        source: mount_type.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
    };
    vec![
        mount("/proc", "proc", &["nosuid", "noexec", "nodev"]),
        mount("/dev", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        mount("/dev/pts", "devpts", &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]),
        mount("/dev/shm", "tmpfs", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        mount("/dev/mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        mount("/sys", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ]
}
