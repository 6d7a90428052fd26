//! Control-plane initialization and worker join.
//!
//! The control plane runs `kubeadm init`, scrapes the join secrets from its output and
//! stores them as a [`JoinCredential`] at [`REMOTE_JOIN_CREDENTIAL_PATH`]. A worker waits
//! for the API server port to open, copies that file over ssh and runs `kubeadm join`.
//!
//! ```text
//! NotInitialized ─┬─> ControlPlaneInitializing ─> ControlPlaneReady
//!                 └─> WorkerWaitingForControlPlane ─> WorkerJoining ─> Joined
//! (any non-terminal state) ─> Failed
//! ```

use std::fmt;
use std::io;
use std::time::Duration;

use ki_paths::{HostPaths, REMOTE_JOIN_CREDENTIAL_PATH};

use crate::credential::{CredentialExtractionFailed, InvalidCredential, JoinCredential, extract_join_secrets};
use crate::exec::{ExecError, Invocation, SystemExecutor, blocking};
use crate::poll::{PollPolicy, poll_until};
use crate::probe::{PortProbe, join_host_port};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum BootstrapState {
    NotInitialized,
    ControlPlaneInitializing,
    ControlPlaneReady,
    WorkerWaitingForControlPlane,
    WorkerJoining,
    Joined,
    Failed,
}

impl BootstrapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ControlPlaneReady | Self::Joined | Self::Failed)
    }

    fn can_become(self, next: Self) -> bool {
        use BootstrapState::*;
        match (self, next) {
            (NotInitialized, ControlPlaneInitializing)
            | (ControlPlaneInitializing, ControlPlaneReady)
            | (NotInitialized, WorkerWaitingForControlPlane)
            | (WorkerWaitingForControlPlane, WorkerJoining)
            | (WorkerJoining, Joined) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Arguments for `kubeadm init`.
#[derive(Clone, Debug)]
pub struct InitOptions {
    /// Externally reachable address of this node. Used as the control-plane endpoint.
    pub advertise_address: String,
    pub api_server_port: u16,
    pub pod_network_cidr: String,
    pub service_cidr: String,
    pub extra_sans: Vec<String>,
    /// kubeadm phases to skip, e.g. `addon/kube-proxy` when the CNI replaces it.
    pub skip_phases: Vec<String>,
}

impl InitOptions {
    fn invocation(&self) -> Invocation {
        let mut init = Invocation::new("kubeadm").arg("init");
        if !self.skip_phases.is_empty() {
            init = init.arg(format!("--skip-phases={}", self.skip_phases.join(",")));
        }
        if !self.pod_network_cidr.is_empty() {
            init = init.arg(format!("--pod-network-cidr={}", self.pod_network_cidr));
        }
        if !self.service_cidr.is_empty() {
            init = init.arg(format!("--service-cidr={}", self.service_cidr));
        }
        init = init.arg(format!("--control-plane-endpoint={}", self.advertise_address));
        init.args(self.extra_sans.iter().map(|san| format!("--apiserver-cert-extra-sans={san}")))
    }
}

/// How a worker finds and joins its control plane.
#[derive(Clone, Debug)]
pub struct JoinOptions {
    /// Address of the control plane on the private network.
    pub control_plane: String,
    pub api_server_port: u16,
    /// Account on the control plane that may `sudo cat` the credential file.
    pub remote_user: String,
    /// Polling of the API server port.
    pub readiness: PollPolicy,
    /// Retries of the credential download.
    pub retrieval: PollPolicy,
}

#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("cannot go from {from} to {to}")]
    InvalidTransition { from: BootstrapState, to: BootstrapState },
    #[error("kubeadm init failed")]
    Init(#[source] ExecError),
    #[error(transparent)]
    CredentialExtractionFailed(#[from] CredentialExtractionFailed),
    #[error("failed to store the join credential at {path}")]
    PersistCredential {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("control plane at {endpoint} was not reachable within {}s", .waited.as_secs())]
    ControlPlaneUnreachable {
        endpoint: String,
        waited: Duration,
        #[source]
        source: io::Error,
    },
    #[error("could not retrieve the join credential from {host} after {attempts} attempts")]
    CredentialUnavailable {
        host: String,
        attempts: u32,
        #[source]
        source: RetrieveError,
    },
    #[error(transparent)]
    InvalidCredential(#[from] InvalidCredential),
    #[error("kubeadm join failed")]
    Join(#[source] ExecError),
}

/// Why a single attempt to read the remote credential failed.
#[derive(thiserror::Error, Debug)]
pub enum RetrieveError {
    #[error(transparent)]
    Remote(ExecError),
    #[error("credential file is not valid JSON")]
    Malformed(#[source] serde_json::Error),
}

pub struct ClusterBootstrapCoordinator<'a, E, P> {
    exec: &'a E,
    probe: &'a P,
    paths: &'a HostPaths,
    state: BootstrapState,
}

impl<E, P> fmt::Debug for ClusterBootstrapCoordinator<'_, E, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterBootstrapCoordinator")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'a, E: SystemExecutor, P: PortProbe> ClusterBootstrapCoordinator<'a, E, P> {
    pub fn new(exec: &'a E, probe: &'a P, paths: &'a HostPaths) -> Self {
        Self {
            exec,
            probe,
            paths,
            state: BootstrapState::NotInitialized,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    fn transition(&mut self, next: BootstrapState) -> Result<(), BootstrapError> {
        if !self.state.can_become(next) {
            return Err(BootstrapError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("bootstrap state: {} -> {next}", self.state);
        self.state = next;
        Ok(())
    }

    /// Move to `next` if `result` is ok, otherwise to `Failed`.
    fn settle<T>(&mut self, result: Result<T, BootstrapError>, next: BootstrapState) -> Result<T, BootstrapError> {
        match result {
            Ok(value) => {
                self.transition(next)?;
                Ok(value)
            }
            Err(e) => {
                self.state = BootstrapState::Failed;
                Err(e)
            }
        }
    }

    /// Run `kubeadm init` and store the resulting join credential.
    ///
    /// Not idempotent: kubeadm refuses to initialize a node twice.
    pub fn init_control_plane(&mut self, opts: &InitOptions) -> Result<JoinCredential, BootstrapError> {
        self.transition(BootstrapState::ControlPlaneInitializing)?;
        let result = self.init(opts);
        self.settle(result, BootstrapState::ControlPlaneReady)
    }

    fn init(&self, opts: &InitOptions) -> Result<JoinCredential, BootstrapError> {
        let invocation = opts.invocation();
        tracing::info!("Running {invocation}");
        let output = self.exec.capture(&invocation).map_err(BootstrapError::Init)?;
        let secrets = extract_join_secrets(&output)?;
        let credential = JoinCredential {
            endpoint: join_host_port(&opts.advertise_address, opts.api_server_port),
            token: secrets.token,
            ca_hash: secrets.ca_hash,
        };
        tracing::info!("Join CA cert hash: {}", credential.ca_hash);

        let file = &self.paths.join_credential;
        let persist_err = |source: io::Error| BootstrapError::PersistCredential {
            path: file.display().to_string(),
            source,
        };
        let json = serde_json::to_vec(&credential).map_err(|e| persist_err(e.into()))?;
        tracing::info!("Writing {}", file.display());
        file.write_atomic(json, 0o600).map_err(persist_err)?;
        Ok(credential)
    }

    /// Wait for the control plane, fetch its join credential and run `kubeadm join`.
    ///
    /// Both waits are bounded by their own deadline. `kubeadm join` itself runs once.
    pub async fn join_worker(&mut self, opts: &JoinOptions) -> Result<JoinCredential, BootstrapError> {
        self.transition(BootstrapState::WorkerWaitingForControlPlane)?;
        let result = self.wait_for_control_plane(opts).await;
        self.settle(result, BootstrapState::WorkerJoining)?;

        let result = self.join(opts).await;
        self.settle(result, BootstrapState::Joined)
    }

    async fn wait_for_control_plane(&self, opts: &JoinOptions) -> Result<(), BootstrapError> {
        let endpoint = join_host_port(&opts.control_plane, opts.api_server_port);
        tracing::info!("Waiting for the control plane at {endpoint}");
        let probe = self.probe;
        let addr = endpoint.as_str();
        poll_until("control plane", opts.readiness, move || probe.connect(addr))
            .await
            .map_err(|e| BootstrapError::ControlPlaneUnreachable {
                endpoint: endpoint.clone(),
                waited: e.elapsed,
                source: e.last_error,
            })?;
        tracing::info!("Control plane is up");
        Ok(())
    }

    async fn join(&self, opts: &JoinOptions) -> Result<JoinCredential, BootstrapError> {
        let credential = self.retrieve_credential(opts).await?;
        credential.validate()?;
        tracing::info!("Joining the cluster at {}", credential.endpoint);
        let join = Invocation::new("kubeadm")
            .args(["join", &credential.endpoint, "--token", &credential.token])
            .args(["--discovery-token-ca-cert-hash", &credential.ca_hash])
            .sensitive();
        self.exec.run(&join).map_err(BootstrapError::Join)?;
        Ok(credential)
    }

    async fn retrieve_credential(&self, opts: &JoinOptions) -> Result<JoinCredential, BootstrapError> {
        tracing::info!("Fetching the join credential from {}", opts.control_plane);
        let ssh = remote_read(&opts.remote_user, &opts.control_plane, REMOTE_JOIN_CREDENTIAL_PATH);
        let exec = self.exec;
        let ssh = &ssh;
        poll_until("join credential", opts.retrieval, move || async move {
            // ssh can sit in its connect timeout.
            blocking(|| exec.read(ssh))
                .map_err(RetrieveError::Remote)
                .and_then(|out| serde_json::from_str::<JoinCredential>(&out).map_err(RetrieveError::Malformed))
        })
        .await
        .map_err(|e| BootstrapError::CredentialUnavailable {
            host: opts.control_plane.clone(),
            attempts: e.attempts,
            source: e.last_error,
        })
    }
}

/// `sudo cat` a file on `host` as `user`, trusting the host key on first use.
fn remote_read(user: &str, host: &str, path: &str) -> Invocation {
    Invocation::new("ssh")
        .args(["-o", "StrictHostKeyChecking=accept-new"])
        .args(["-o", "BatchMode=yes"])
        .args(["-o", "ConnectTimeout=5"])
        .arg(format!("{user}@{host}"))
        .args(["sudo", "cat", path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::RecordingExecutor;
    use ki_paths::RootDir;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;
    use tokio::time::Instant;

    const KUBEADM_INIT: &str = include_str!("../tests/fixtures/kubeadm-init.txt");
    const CREDENTIAL_JSON: &str = r#"{"endpoint":"10.0.0.2:6443","token":"abc.def","hash":"sha256:deadbeef"}"#;
    const SSH: &str = "ssh -o StrictHostKeyChecking=accept-new -o BatchMode=yes -o ConnectTimeout=5 cluster@10.0.0.2 sudo cat /etc/kubeadm-init.json";

    fn host() -> (tempfile::TempDir, HostPaths) {
        let root = tempfile::tempdir().unwrap();
        let paths = HostPaths::from_root_dir(&RootDir(root.path().to_path_buf()));
        (root, paths)
    }

    fn init_options() -> InitOptions {
        InitOptions {
            advertise_address: "203.0.113.7".to_owned(),
            api_server_port: 6443,
            pod_network_cidr: "10.244.0.0/16".to_owned(),
            service_cidr: "10.96.0.0/12".to_owned(),
            extra_sans: vec!["k8s.example.com".to_owned()],
            skip_phases: vec!["addon/kube-proxy".to_owned()],
        }
    }

    fn join_options() -> JoinOptions {
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
        JoinOptions {
            control_plane: "10.0.0.2".to_owned(),
            api_server_port: 6443,
            remote_user: "cluster".to_owned(),
            readiness: policy,
            retrieval: policy,
        }
    }

    /// Refuses connections until `after` has passed since creation.
    struct OpensAfter {
        start: Instant,
        after: Option<Duration>,
    }

    impl OpensAfter {
        fn new(after: Option<Duration>) -> Self {
            Self {
                start: Instant::now(),
                after,
            }
        }
    }

    #[async_trait::async_trait]
    impl PortProbe for OpensAfter {
        async fn connect(&self, _addr: &str) -> io::Result<()> {
            match self.after {
                Some(after) if self.start.elapsed() >= after => Ok(()),
                _ => Err(io::ErrorKind::ConnectionRefused.into()),
            }
        }
    }

    #[test]
    fn init_persists_credential() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new().respond("kubeadm init", KUBEADM_INIT);
        let probe = OpensAfter::new(None);
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);

        let credential = coordinator.init_control_plane(&init_options()).unwrap();

        assert_eq!(coordinator.state(), BootstrapState::ControlPlaneReady);
        assert_eq!(
            exec.commands(),
            ["kubeadm init --skip-phases=addon/kube-proxy --pod-network-cidr=10.244.0.0/16 \
              --service-cidr=10.96.0.0/12 --control-plane-endpoint=203.0.113.7 \
              --apiserver-cert-extra-sans=k8s.example.com"]
        );
        assert_eq!(credential.endpoint, "203.0.113.7:6443");
        assert_eq!(credential.token, "k3v9qa.5lq0x1w2c8r7ntzd");

        let stored: JoinCredential = serde_json::from_slice(&paths.join_credential.read().unwrap()).unwrap();
        assert_eq!(stored, credential);
        let mode = paths.join_credential.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn init_without_join_command_fails() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new().respond("kubeadm init", "[init] Using Kubernetes version: v1.31.1\n");
        let probe = OpensAfter::new(None);
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);

        let err = coordinator.init_control_plane(&init_options()).unwrap_err();

        assert!(matches!(err, BootstrapError::CredentialExtractionFailed(_)), "{err:?}");
        assert_eq!(coordinator.state(), BootstrapState::Failed);
        assert!(!paths.join_credential.exists());
    }

    #[test]
    fn init_failure_is_not_retried() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new().fail("kubeadm init", 1);
        let probe = OpensAfter::new(None);
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);

        assert!(matches!(
            coordinator.init_control_plane(&init_options()),
            Err(BootstrapError::Init(_))
        ));
        assert_eq!(exec.calls().len(), 1);

        // Failed is terminal
        let err = coordinator.init_control_plane(&init_options()).unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_joins_once_control_plane_is_reachable() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new().respond("ssh", CREDENTIAL_JSON);
        let probe = OpensAfter::new(Some(Duration::from_secs(3)));
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);
        let start = Instant::now();

        let credential = coordinator.join_worker(&join_options()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(coordinator.state(), BootstrapState::Joined);
        assert_eq!(credential.ca_hash, "sha256:deadbeef");
        assert_eq!(
            exec.commands(),
            [
                SSH,
                "kubeadm join 10.0.0.2:6443 --token abc.def --discovery-token-ca-cert-hash sha256:deadbeef"
            ]
        );
        assert!(exec.calls()[1].sensitive);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_control_plane_fails_at_deadline() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new();
        let probe = OpensAfter::new(None);
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);
        let start = Instant::now();

        let err = coordinator.join_worker(&join_options()).await.unwrap_err();

        assert!(start.elapsed() >= Duration::from_secs(300));
        assert!(start.elapsed() < Duration::from_secs(302));
        assert!(matches!(err, BootstrapError::ControlPlaneUnreachable { .. }), "{err:?}");
        assert_eq!(coordinator.state(), BootstrapState::Failed);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn credential_retrieval_retries_until_file_exists() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new()
            .fail_times("ssh", 255, 2)
            .fail_times("ssh", 1, 2)
            .respond("ssh", CREDENTIAL_JSON);
        let probe = OpensAfter::new(Some(Duration::ZERO));
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);
        let start = Instant::now();

        coordinator.join_worker(&join_options()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(4));
        let ssh_calls = exec.commands().iter().filter(|c| c.starts_with("ssh")).count();
        assert_eq!(ssh_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_never_appears() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new().fail("ssh", 1);
        let probe = OpensAfter::new(Some(Duration::ZERO));
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);

        let err = coordinator.join_worker(&join_options()).await.unwrap_err();

        assert!(matches!(&err, BootstrapError::CredentialUnavailable { attempts: 301, .. }), "{err:?}");
        assert!(!exec.commands().iter().any(|c| c.starts_with("kubeadm")));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_credential_is_rejected_before_join() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new().respond("ssh", r#"{"endpoint":"10.0.0.2:6443","token":"","hash":"sha256:x"}"#);
        let probe = OpensAfter::new(Some(Duration::ZERO));
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);

        let err = coordinator.join_worker(&join_options()).await.unwrap_err();

        assert!(matches!(err, BootstrapError::InvalidCredential(_)), "{err:?}");
        assert_eq!(coordinator.state(), BootstrapState::Failed);
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn join_failure_is_not_retried() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new()
            .respond("ssh", CREDENTIAL_JSON)
            .fail("kubeadm join", 1);
        let probe = OpensAfter::new(Some(Duration::ZERO));
        let mut coordinator = ClusterBootstrapCoordinator::new(&exec, &probe, &paths);

        let err = coordinator.join_worker(&join_options()).await.unwrap_err();

        assert!(matches!(err, BootstrapError::Join(_)));
        assert_eq!(exec.calls().len(), 2);
    }

    #[test]
    fn roles_cannot_be_mixed() {
        assert!(!BootstrapState::ControlPlaneReady.can_become(BootstrapState::WorkerWaitingForControlPlane));
        assert!(!BootstrapState::Joined.can_become(BootstrapState::Failed));
        assert!(BootstrapState::WorkerJoining.can_become(BootstrapState::Failed));
    }
}
