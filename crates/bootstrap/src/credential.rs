//! The join credential that `kubeadm init` prints and workers need.
//!
//! kubeadm has no machine-readable form of its join command, so the token and CA hash are
//! scraped from its human-readable output. Everything that depends on that format lives here
//! and is pinned by the golden output under `tests/fixtures`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"--token (\S+)").unwrap();
    static ref CA_HASH: Regex = Regex::new(r"--discovery-token-ca-cert-hash (\S+)").unwrap();
}

/// Everything a worker needs for `kubeadm join`. Stored as JSON on the control plane.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCredential {
    /// `host:port` of the API server.
    pub endpoint: String,
    pub token: String,
    #[serde(rename = "hash")]
    pub ca_hash: String,
}

impl std::fmt::Debug for JoinCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinCredential")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("ca_hash", &self.ca_hash)
            .finish()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("join credential has an empty {}", .empty.join(", "))]
pub struct InvalidCredential {
    pub empty: Vec<&'static str>,
}

impl JoinCredential {
    pub fn validate(&self) -> Result<(), InvalidCredential> {
        let empty: Vec<_> = [
            ("endpoint", &self.endpoint),
            ("token", &self.token),
            ("hash", &self.ca_hash),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect();
        if empty.is_empty() { Ok(()) } else { Err(InvalidCredential { empty }) }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("no {} found in kubeadm init output", .missing.join(" or "))]
pub struct CredentialExtractionFailed {
    pub missing: Vec<&'static str>,
}

/// The token and CA hash from a join command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinSecrets {
    pub token: String,
    pub ca_hash: String,
}

/// Scan `output` line by line for the join token and CA cert hash.
///
/// kubeadm prints the join command twice (control plane and worker) with the same values; if
/// they ever disagree, the last occurrence wins.
pub fn extract_join_secrets(output: &str) -> Result<JoinSecrets, CredentialExtractionFailed> {
    let mut token = None;
    let mut ca_hash = None;
    for line in output.lines() {
        if let Some(m) = TOKEN.captures(line) {
            token = Some(m[1].to_owned());
        }
        if let Some(m) = CA_HASH.captures(line) {
            ca_hash = Some(m[1].to_owned());
        }
    }
    match (token, ca_hash) {
        (Some(token), Some(ca_hash)) => Ok(JoinSecrets { token, ca_hash }),
        (token, ca_hash) => Err(CredentialExtractionFailed {
            missing: [("token", token.is_none()), ("CA cert hash", ca_hash.is_none())]
                .into_iter()
                .filter_map(|(what, missing)| missing.then_some(what))
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KUBEADM_INIT: &str = include_str!("../tests/fixtures/kubeadm-init.txt");

    #[test]
    fn golden_kubeadm_output() {
        let secrets = extract_join_secrets(KUBEADM_INIT).unwrap();
        assert_eq!(
            secrets,
            JoinSecrets {
                token: "k3v9qa.5lq0x1w2c8r7ntzd".to_owned(),
                ca_hash: "sha256:5a2a48f1b6c0e3a0b1d7c39e0d6b1b6c2f3bb0f5c2b2a9e8b4c1f6e3d2a1b0c9".to_owned(),
            }
        );
    }

    #[test]
    fn single_line() {
        let secrets =
            extract_join_secrets("kubeadm join 10.0.0.2:6443 --token abc.def --discovery-token-ca-cert-hash sha256:deadbeef")
                .unwrap();
        assert_eq!(secrets.token, "abc.def");
        assert_eq!(secrets.ca_hash, "sha256:deadbeef");
    }

    #[test]
    fn last_match_wins() {
        let out = "--token first.one\n--token second.two\n--discovery-token-ca-cert-hash sha256:aa\n";
        assert_eq!(extract_join_secrets(out).unwrap().token, "second.two");
    }

    #[test]
    fn missing_hash() {
        let err = extract_join_secrets("kubeadm join 10.0.0.2:6443 --token abc.def \\\n").unwrap_err();
        assert_eq!(err.missing, ["CA cert hash"]);
        assert_eq!(err.to_string(), "no CA cert hash found in kubeadm init output");
    }

    #[test]
    fn missing_both() {
        let err = extract_join_secrets("[init] Using Kubernetes version: v1.31.1\n").unwrap_err();
        assert_eq!(err.missing, ["token", "CA cert hash"]);
    }

    #[test]
    fn json_uses_short_field_names() {
        let credential = JoinCredential {
            endpoint: "10.0.0.2:6443".to_owned(),
            token: "abc.def".to_owned(),
            ca_hash: "sha256:deadbeef".to_owned(),
        };
        let json = serde_json::to_string(&credential).unwrap();
        assert_eq!(json, r#"{"endpoint":"10.0.0.2:6443","token":"abc.def","hash":"sha256:deadbeef"}"#);
        assert!(!format!("{credential:?}").contains("abc.def"));
    }

    #[test]
    fn empty_fields_are_invalid() {
        let credential: JoinCredential = serde_json::from_str(r#"{"endpoint":"10.0.0.2:6443","token":"","hash":" "}"#).unwrap();
        assert_eq!(credential.validate().unwrap_err().empty, ["token", "hash"]);
    }
}
