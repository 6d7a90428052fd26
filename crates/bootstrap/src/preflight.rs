//! Checks that must pass before the host is touched.

use crate::exec::{ExecError, Invocation, SystemExecutor};
use crate::probe::PortProbe;

#[derive(thiserror::Error, Debug)]
pub enum PreflightError {
    #[error("failed to detect the OS release")]
    DetectRelease(#[source] ExecError),
    #[error("unsupported OS: {codename} (supported: {})", .supported.join(", "))]
    UnsupportedOs { codename: String, supported: Vec<String> },
    #[error("port {port} is in use")]
    PortInUse { port: u16 },
}

/// The distribution codename, e.g. `noble`.
pub fn release_codename(exec: &impl SystemExecutor) -> Result<String, PreflightError> {
    exec.read(&Invocation::new("lsb_release").arg("-cs"))
        .map(|out| out.trim().to_owned())
        .map_err(PreflightError::DetectRelease)
}

/// Fails unless the host runs one of the `supported` releases. Returns the detected codename.
pub fn check_os(exec: &impl SystemExecutor, supported: &[String]) -> Result<String, PreflightError> {
    let codename = release_codename(exec)?;
    tracing::info!("OS release: {codename}");
    if !supported.iter().any(|s| *s == codename) {
        return Err(PreflightError::UnsupportedOs {
            codename,
            supported: supported.to_vec(),
        });
    }
    Ok(codename)
}

/// Fails if anything accepts connections on local `port`.
///
/// This is a connect probe, not a bind test: a refused connect counts as free, and the port
/// can still be taken by someone else between this check and its eventual use.
pub async fn check_port_free(probe: &impl PortProbe, port: u16) -> Result<(), PreflightError> {
    tracing::info!("Checking port {port}");
    match probe.connect(&format!("127.0.0.1:{port}")).await {
        Ok(()) => Err(PreflightError::PortInUse { port }),
        Err(_) => {
            tracing::info!("Port {port} is free");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::RecordingExecutor;
    use crate::probe::TcpProbe;

    fn supported() -> Vec<String> {
        vec!["noble".to_owned()]
    }

    #[test]
    fn accepts_supported_release() {
        let exec = RecordingExecutor::new().respond("lsb_release -cs", "noble\n");
        assert_eq!(check_os(&exec, &supported()).unwrap(), "noble");
    }

    #[test]
    fn rejects_other_release() {
        let exec = RecordingExecutor::new().respond("lsb_release -cs", "jammy\n");
        let err = check_os(&exec, &supported()).unwrap_err();
        assert!(matches!(&err, PreflightError::UnsupportedOs { codename, .. } if codename == "jammy"));
        assert_eq!(err.to_string(), "unsupported OS: jammy (supported: noble)");
    }

    #[test]
    fn release_detection_failure_is_reported() {
        let exec = RecordingExecutor::new().fail("lsb_release", 127);
        assert!(matches!(check_os(&exec, &supported()), Err(PreflightError::DetectRelease(_))));
    }

    #[tokio::test]
    async fn occupied_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = check_port_free(&TcpProbe::default(), port).await.unwrap_err();
        assert!(matches!(err, PreflightError::PortInUse { port: p } if p == port));

        drop(listener);
        check_port_free(&TcpProbe::default(), port).await.unwrap();
    }
}
