use ki_paths::KubeconfigFile;
use serde_json::json;

use crate::exec::{ExecError, Invocation, SystemExecutor};

#[derive(thiserror::Error, Debug)]
#[error("kubectl apply of {what} failed")]
pub struct ApplyError {
    pub what: String,
    #[source]
    pub source: ExecError,
}

/// Applies manifests with `kubectl apply`, which makes every operation here idempotent.
pub struct Kubectl<'a, E> {
    exec: &'a E,
    kubeconfig: &'a KubeconfigFile,
}

impl<'a, E: SystemExecutor> Kubectl<'a, E> {
    pub fn new(exec: &'a E, kubeconfig: &'a KubeconfigFile) -> Self {
        Self { exec, kubeconfig }
    }

    /// Apply a manifest passed on stdin, so its contents never show up in the process list.
    pub fn apply(&self, what: &str, manifest: &serde_json::Value) -> Result<(), ApplyError> {
        tracing::info!("Applying {what}");
        let invocation = Invocation::new("kubectl")
            .args(["apply", "-f", "-"])
            .env("KUBECONFIG", self.kubeconfig.display().to_string())
            .stdin(manifest.to_string());
        self.exec.run(&invocation).map_err(|source| ApplyError {
            what: what.to_owned(),
            source,
        })
    }

    pub fn apply_namespace(&self, name: &str) -> Result<(), ApplyError> {
        self.apply(&format!("namespace {name}"), &namespace(name))
    }

    pub fn apply_secret<'s>(
        &self,
        namespace: &str,
        name: &str,
        data: impl IntoIterator<Item = (&'s str, &'s str)>,
    ) -> Result<(), ApplyError> {
        self.apply(&format!("secret {namespace}/{name}"), &secret(namespace, name, data))
    }
}

fn namespace(name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name },
    })
}

fn secret<'s>(namespace: &str, name: &str, data: impl IntoIterator<Item = (&'s str, &'s str)>) -> serde_json::Value {
    let string_data: serde_json::Map<String, serde_json::Value> =
        data.into_iter().map(|(k, v)| (k.to_owned(), v.into())).collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": { "name": name, "namespace": namespace },
        "stringData": string_data,
    })
}
