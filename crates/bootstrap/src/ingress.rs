//! A catch-all ingress so a fresh cluster answers HTTP on its load balancer.
//!
//! Traffic goes through Cilium's shared ingress controller to a small echo backend that
//! replies `200 OK` on every path.

use ki_paths::KubeconfigFile;
use serde_json::json;

use crate::exec::SystemExecutor;
use crate::kubectl::{ApplyError, Kubectl};

pub const NAMESPACE: &str = "default";
pub const NAME: &str = "default-backend";
pub const INGRESS_CLASS: &str = "cilium";
const IMAGE: &str = "hashicorp/http-echo:1.0";
const PORT: u16 = 8080;

/// The backend deployment, its service and the ingress routing everything to it.
pub fn default_ingress() -> serde_json::Value {
    let labels = json!({ "app.kubernetes.io/name": NAME });
    let metadata = json!({ "name": NAME, "namespace": NAMESPACE, "labels": labels });
    json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": metadata,
                "spec": {
                    "replicas": 1,
                    "selector": { "matchLabels": labels },
                    "template": {
                        "metadata": { "labels": labels },
                        "spec": {
                            "containers": [{
                                "name": "echo",
                                "image": IMAGE,
                                "args": [format!("-listen=:{PORT}"), "-text=ok"],
                                "ports": [{ "name": "http", "containerPort": PORT }],
                            }],
                        },
                    },
                },
            },
            {
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": metadata,
                "spec": {
                    "selector": labels,
                    "ports": [{ "name": "http", "port": 80, "targetPort": "http" }],
                },
            },
            {
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": metadata,
                "spec": {
                    "ingressClassName": INGRESS_CLASS,
                    "defaultBackend": {
                        "service": { "name": NAME, "port": { "name": "http" } },
                    },
                },
            },
        ],
    })
}

pub fn install_default_ingress<E: SystemExecutor>(exec: &E, kubeconfig: &KubeconfigFile) -> Result<(), ApplyError> {
    Kubectl::new(exec, kubeconfig).apply("default ingress", &default_ingress())
}
