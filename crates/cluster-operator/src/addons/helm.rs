//! Helm-backed addon installer.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::addons::{AddonInstaller, CNI_ADDON};
use crate::crd::AddonSpec;
use crate::error::{Error, Result};

/// Per-command deadline for helm and kubectl.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Charts for the addons the operator knows out of the box. Unknown addon
/// names must carry a `chart` value in their spec values.
fn known_chart(name: &str) -> Option<(&'static str, &'static str, &'static str)> {
    // (repo name, repo url, chart)
    match name {
        "cilium" => Some(("cilium", "https://helm.cilium.io/", "cilium/cilium")),
        "metrics-server" => Some((
            "metrics-server",
            "https://kubernetes-sigs.github.io/metrics-server/",
            "metrics-server/metrics-server",
        )),
        "cert-manager" => Some(("jetstack", "https://charts.jetstack.io", "jetstack/cert-manager")),
        _ => None,
    }
}

fn addon_namespace(name: &str) -> &'static str {
    match name {
        CNI_ADDON | "metrics-server" => "kube-system",
        _ => "addons",
    }
}

/// Installs addons by driving the `helm` and `kubectl` binaries against a
/// kubeconfig staged in a temp file.
#[derive(Debug, Clone, Default)]
pub struct HelmInstaller;

impl HelmInstaller {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn write_kubeconfig(kubeconfig: &[u8]) -> Result<PathBuf> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("addon-kubeconfig-{nanos}"));
        tokio::fs::write(&path, kubeconfig)
            .await
            .map_err(|e| Error::Config(format!("staging kubeconfig: {e}")))?;
        Ok(path)
    }

    async fn run(program: &str, kubeconfig: &PathBuf, args: &[String]) -> Result<String> {
        debug!(program, ?args, "Running addon command");

        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(program)
                .env("KUBECONFIG", kubeconfig)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::WaitTimeout {
            target: format!("{program} {}", args.first().map_or("", String::as_str)),
            seconds: COMMAND_TIMEOUT.as_secs(),
        })?
        .map_err(|e| Error::Config(format!("running {program}: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::Config(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn helm_args(addon: &AddonSpec) -> (Vec<String>, &'static str) {
        let namespace = addon_namespace(&addon.name);
        let chart = known_chart(&addon.name).map_or_else(
            || {
                addon
                    .values
                    .as_ref()
                    .and_then(|v| v.get("chart").cloned())
                    .unwrap_or_else(|| addon.name.clone())
            },
            |(_, _, chart)| chart.to_string(),
        );

        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            addon.name.clone(),
            chart,
            "--namespace".to_string(),
            namespace.to_string(),
            "--create-namespace".to_string(),
            "--wait".to_string(),
        ];
        if let Some(version) = &addon.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        if let Some(values) = &addon.values {
            for (key, value) in values {
                if key == "chart" {
                    continue;
                }
                args.push("--set".to_string());
                args.push(format!("{key}={value}"));
            }
        }
        // Cilium replaces kube-proxy; the machine configs already disabled
        // it and shipped no default CNI.
        if addon.name == CNI_ADDON {
            args.push("--set".to_string());
            args.push("kubeProxyReplacement=true".to_string());
        }

        (args, namespace)
    }
}

#[async_trait]
impl AddonInstaller for HelmInstaller {
    async fn install(&self, kubeconfig: &[u8], addon: &AddonSpec) -> Result<()> {
        let path = Self::write_kubeconfig(kubeconfig).await?;

        if let Some((repo, url, _)) = known_chart(&addon.name) {
            // Repo add is idempotent; a failure here only matters if the
            // install itself fails.
            let _ = Self::run(
                "helm",
                &path,
                &[
                    "repo".to_string(),
                    "add".to_string(),
                    repo.to_string(),
                    url.to_string(),
                ],
            )
            .await;
            let _ = Self::run("helm", &path, &["repo".to_string(), "update".to_string()]).await;
        }

        let (args, _namespace) = Self::helm_args(addon);
        let result = Self::run("helm", &path, &args).await;
        let _ = tokio::fs::remove_file(&path).await;
        result?;

        info!(addon = %addon.name, "Addon installed");
        Ok(())
    }

    async fn is_healthy(&self, kubeconfig: &[u8], addon: &AddonSpec) -> Result<bool> {
        let path = Self::write_kubeconfig(kubeconfig).await?;

        // Cilium health is its DaemonSet rollout; for everything else a
        // deployed helm release counts.
        let result = if addon.name == CNI_ADDON {
            Self::run(
                "kubectl",
                &path,
                &[
                    "-n".to_string(),
                    "kube-system".to_string(),
                    "rollout".to_string(),
                    "status".to_string(),
                    "daemonset/cilium".to_string(),
                    "--timeout=30s".to_string(),
                ],
            )
            .await
            .map(|_| true)
        } else {
            Self::run(
                "helm",
                &path,
                &[
                    "status".to_string(),
                    addon.name.clone(),
                    "--namespace".to_string(),
                    addon_namespace(&addon.name).to_string(),
                ],
            )
            .await
            .map(|out| out.contains("STATUS: deployed"))
        };

        let _ = tokio::fs::remove_file(&path).await;

        match result {
            Ok(healthy) => Ok(healthy),
            Err(Error::Config(_) | Error::WaitTimeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
