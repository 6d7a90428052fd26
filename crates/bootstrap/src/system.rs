//! Host kernel and memory settings the kubelet depends on.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;

use ki_paths::HostPaths;

use crate::exec::{ExecError, Invocation, SystemExecutor};

/// Marks a mount line as a swap entry.
const SWAP_MARKER: &str = " swap ";

#[derive(thiserror::Error, Debug)]
pub enum SystemError {
    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to deactivate swap")]
    SwapOff(#[source] ExecError),
    #[error("failed to load kernel module {module}")]
    LoadModule {
        module: String,
        #[source]
        source: ExecError,
    },
    #[error("kernel parameters were written to {} but reloading them failed", .path.display())]
    Reload {
        path: PathBuf,
        #[source]
        source: ExecError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapOutcome {
    AlreadyDisabled,
    Disabled { commented: usize },
}

pub struct SystemConfigurator<'a, E> {
    exec: &'a E,
    paths: &'a HostPaths,
}

impl<'a, E: SystemExecutor> SystemConfigurator<'a, E> {
    pub fn new(exec: &'a E, paths: &'a HostPaths) -> Self {
        Self { exec, paths }
    }

    /// Comment out every active swap entry in fstab, then turn swap off.
    ///
    /// If fstab has no active swap entry, nothing is touched. The file is rewritten before
    /// `swapoff` runs, so a crash in between leaves a state that is safe to re-run.
    pub fn disable_swap(&self) -> Result<SwapOutcome, SystemError> {
        let fstab = &self.paths.fstab;
        let text = fstab.read_to_string().map_err(|source| SystemError::Read {
            path: fstab.0.clone(),
            source,
        })?;
        let Some((rewritten, commented)) = comment_out_swap(&text) else {
            tracing::info!("Swap is not enabled");
            return Ok(SwapOutcome::AlreadyDisabled);
        };
        tracing::info!("Updating {}", fstab.display());
        fstab
            .write_atomic(rewritten, file_mode(fstab.metadata().ok()))
            .map_err(|source| SystemError::Write {
                path: fstab.0.clone(),
                source,
            })?;
        tracing::info!("Disabling swap");
        self.exec
            .run(&Invocation::new("swapoff").arg("-a"))
            .map_err(SystemError::SwapOff)?;
        Ok(SwapOutcome::Disabled { commented })
    }

    /// Load `modules` in order, then persist the list so they load again on boot.
    ///
    /// Stops at the first module that fails to load; nothing is persisted in that case.
    pub fn load_kernel_modules(&self, profile: &str, modules: &[&str]) -> Result<(), SystemError> {
        for module in modules {
            tracing::info!("Loading module {module}");
            self.exec
                .run(&Invocation::new("modprobe").arg(*module))
                .map_err(|source| SystemError::LoadModule {
                    module: (*module).to_owned(),
                    source,
                })?;
        }
        let file = self.paths.modules_load_dir.profile(profile);
        tracing::info!("Writing {}", file.display());
        let contents: String = modules.iter().map(|m| format!("{m}\n")).collect();
        file.write_atomic(contents, 0o644).map_err(|source| SystemError::Write {
            path: file.0.clone(),
            source,
        })
    }

    /// Persist `params` as a sysctl profile and reload all profiles.
    pub fn configure_kernel_parameters<K, V>(
        &self,
        profile: &str,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), SystemError>
    where
        K: Into<String>,
        V: Display,
    {
        tracing::info!("Configuring kernel parameters for {profile}");
        let file = self.paths.sysctl_dir.profile(profile);
        tracing::info!("Writing {}", file.display());
        file.write_atomic(render_kernel_parameters(params), 0o644)
            .map_err(|source| SystemError::Write {
                path: file.0.clone(),
                source,
            })?;
        self.exec
            .run(&Invocation::new("sysctl").arg("--system"))
            .map_err(|source| SystemError::Reload { path: file.0, source })
    }
}

fn file_mode(metadata: Option<std::fs::Metadata>) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.map_or(0o644, |m| m.permissions().mode() & 0o7777)
}

/// Prefix every active swap line with `#`, leaving all other bytes untouched.
///
/// Returns `None` if there is no active swap line. Lines that are already comments don't count,
/// which keeps the operation idempotent.
pub fn comment_out_swap(text: &str) -> Option<(String, usize)> {
    // A line already disabled by hand or by an earlier run gets no second `#`.
    let is_active_swap = |line: &str| !line.trim_start().starts_with('#') && line.contains(SWAP_MARKER);
    let mut commented = 0;
    let mut out = String::with_capacity(text.len() + 8);
    for line in text.split_inclusive('\n') {
        if is_active_swap(line) {
            out.push('#');
            commented += 1;
        }
        out.push_str(line);
    }
    (commented > 0).then_some((out, commented))
}

/// `key=value` lines sorted by key, regardless of input order.
pub fn render_kernel_parameters<K, V>(params: impl IntoIterator<Item = (K, V)>) -> String
where
    K: Into<String>,
    V: Display,
{
    let sorted: BTreeMap<String, String> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect();
    sorted.iter().map(|(k, v)| format!("{k}={v}\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::RecordingExecutor;
    use ki_paths::RootDir;
    use pretty_assertions::assert_eq;

    const FSTAB: &str = "\
# /etc/fstab: static file system information.
UUID=0b1c-ext4 / ext4 defaults 0 1
/swap.img\tnone swap sw 0 0
UUID=77aa-vfat /boot/efi vfat umask=0077 0 1
/dev/sdb2 none swap sw 0 0
";

    fn host() -> (tempfile::TempDir, HostPaths) {
        let root = tempfile::tempdir().unwrap();
        let paths = HostPaths::from_root_dir(&RootDir(root.path().to_path_buf()));
        (root, paths)
    }

    #[test]
    fn comments_out_only_swap_lines() {
        let (out, n) = comment_out_swap(FSTAB).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            out,
            "\
# /etc/fstab: static file system information.
UUID=0b1c-ext4 / ext4 defaults 0 1
#/swap.img\tnone swap sw 0 0
UUID=77aa-vfat /boot/efi vfat umask=0077 0 1
#/dev/sdb2 none swap sw 0 0
"
        );
    }

    #[test]
    fn other_lines_are_preserved_exactly() {
        // CRLF, trailing whitespace and a missing final newline all survive.
        let text = "a b c\r\n/dev/x none swap sw\r\n  keep me  \nlast";
        let (out, n) = comment_out_swap(text).unwrap();
        assert_eq!(n, 1);
        let before: Vec<_> = text.split_inclusive('\n').collect();
        let after: Vec<_> = out.split_inclusive('\n').collect();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            if b.contains(SWAP_MARKER) {
                assert_eq!(format!("#{b}"), *a);
            } else {
                assert_eq!(b, a);
            }
        }
    }

    #[test]
    fn no_swap_means_no_change() {
        assert_eq!(comment_out_swap("UUID=1 / ext4 defaults 0 1\n"), None);
        let (once, _) = comment_out_swap(FSTAB).unwrap();
        assert_eq!(comment_out_swap(&once), None);
    }

    #[test]
    fn disable_swap_rewrites_then_swapoff() {
        let (_root, paths) = host();
        paths.fstab.write_atomic(FSTAB, 0o644).unwrap();
        let exec = RecordingExecutor::new();

        let outcome = SystemConfigurator::new(&exec, &paths).disable_swap().unwrap();

        assert_eq!(outcome, SwapOutcome::Disabled { commented: 2 });
        assert_eq!(exec.commands(), ["swapoff -a"]);
        assert!(!paths.fstab.read_to_string().unwrap().contains("\n/dev/sdb2"));

        // a second run is a no-op
        let outcome = SystemConfigurator::new(&exec, &paths).disable_swap().unwrap();
        assert_eq!(outcome, SwapOutcome::AlreadyDisabled);
        assert_eq!(exec.commands().len(), 1);
    }

    #[test]
    fn disable_swap_without_swap_does_nothing() {
        let (_root, paths) = host();
        paths.fstab.write_atomic("UUID=1 / ext4 defaults 0 1\n", 0o644).unwrap();
        let exec = RecordingExecutor::new();
        let outcome = SystemConfigurator::new(&exec, &paths).disable_swap().unwrap();
        assert_eq!(outcome, SwapOutcome::AlreadyDisabled);
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn modules_load_in_order_and_persist() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new();
        SystemConfigurator::new(&exec, &paths)
            .load_kernel_modules("containerd", &["overlay", "br_netfilter"])
            .unwrap();
        assert_eq!(exec.commands(), ["modprobe overlay", "modprobe br_netfilter"]);
        assert_eq!(
            paths.modules_load_dir.profile("containerd").read_to_string().unwrap(),
            "overlay\nbr_netfilter\n"
        );
    }

    #[test]
    fn module_failure_aborts_before_persisting() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new().fail("modprobe overlay", 1);
        let err = SystemConfigurator::new(&exec, &paths)
            .load_kernel_modules("containerd", &["overlay", "br_netfilter"])
            .unwrap_err();
        assert!(matches!(&err, SystemError::LoadModule { module, .. } if module == "overlay"));
        assert_eq!(exec.commands(), ["modprobe overlay"]);
        assert!(!paths.modules_load_dir.profile("containerd").exists());
    }

    #[test]
    fn kernel_parameters_are_sorted() {
        assert_eq!(render_kernel_parameters([("b", 1), ("a", 2)]), "a=2\nb=1\n");
    }

    #[test]
    fn kernel_parameters_written_then_reloaded() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new();
        SystemConfigurator::new(&exec, &paths)
            .configure_kernel_parameters("kubernetes", [("net.ipv4.ip_forward", 1), ("net.bridge.bridge-nf-call-iptables", 1)])
            .unwrap();
        assert_eq!(
            paths.sysctl_dir.profile("kubernetes").read_to_string().unwrap(),
            "net.bridge.bridge-nf-call-iptables=1\nnet.ipv4.ip_forward=1\n"
        );
        assert_eq!(exec.commands(), ["sysctl --system"]);
    }

    #[test]
    fn reload_failure_is_reported_after_write() {
        let (_root, paths) = host();
        let exec = RecordingExecutor::new().fail("sysctl", 1);
        let err = SystemConfigurator::new(&exec, &paths)
            .configure_kernel_parameters("kubernetes", [("a", 1)])
            .unwrap_err();
        assert!(matches!(err, SystemError::Reload { .. }));
        assert!(paths.sysctl_dir.profile("kubernetes").exists());
    }
}
