//! Kubeconfig loading and client construction

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Kubernetes client wrapper
pub struct KubeClient {
    kubeconfig: Option<Kubeconfig>,
    current_context: Option<String>,
}

impl KubeClient {
    /// Load the kubeconfig, falling back to in-cluster configuration when
    /// no kubeconfig is present
    pub fn new() -> Self {
        match Kubeconfig::read() {
            Ok(kubeconfig) => {
                let current_context = kubeconfig.current_context.clone();
                Self {
                    kubeconfig: Some(kubeconfig),
                    current_context,
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "no kubeconfig found, using in-cluster config");
                Self {
                    kubeconfig: None,
                    current_context: None,
                }
            }
        }
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Namespace configured on a context, if any
    pub fn context_namespace(&self, context_name: Option<&str>) -> Option<String> {
        let kubeconfig = self.kubeconfig.as_ref()?;
        let name = context_name.or(self.current_context.as_deref())?;
        kubeconfig
            .contexts
            .iter()
            .find(|ctx| ctx.name == name)
            .and_then(|ctx| ctx.context.as_ref())
            .and_then(|ctx| ctx.namespace.clone())
    }

    /// Create a kube::Client for a specific context (or the current one)
    pub async fn client(&self, context_name: Option<&str>) -> Result<kube::Client> {
        let Some(kubeconfig) = &self.kubeconfig else {
            if let Some(name) = context_name {
                anyhow::bail!("Context '{}' requested but no kubeconfig is available", name);
            }
            let config = kube::Config::incluster()
                .context("Failed to read kubeconfig or in-cluster config. Is kubectl configured?")?;
            return kube::Client::try_from(config).context("Failed to create in-cluster client");
        };

        if let Some(name) = context_name {
            if !kubeconfig.contexts.iter().any(|c| c.name == name) {
                anyhow::bail!("Context '{}' not found in kubeconfig", name);
            }
        }

        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig.clone(),
            &KubeConfigOptions {
                context: context_name.map(str::to_string),
                ..Default::default()
            },
        )
        .await
        .context(format!(
            "Failed to create config for context: {}",
            context_name.or(self.current_context()).unwrap_or("<current>")
        ))?;

        kube::Client::try_from(config).context("Failed to create Kubernetes client")
    }
}

impl Default for KubeClient {
    fn default() -> Self {
        Self::new()
    }
}
