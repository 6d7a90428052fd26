//! The set of host files and directories that node bootstrap reads and writes.
//!
//! Every path hangs off a [`RootDir`], which is `/` on a real node. Pointing it somewhere
//! else relocates the whole layout, which is how tests exercise the configurators against
//! a temporary directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::PathBufExt;

pub mod host;
mod utils;

pub use host::*;

#[doc(hidden)]
pub use serde as __serde;

path_type! {
    /// The directory every host path is resolved against.
    RootDir: dir
}

impl Default for RootDir {
    fn default() -> Self {
        Self(PathBuf::from("/"))
    }
}

/// Location of the join credential on the control plane, as seen by a remote reader.
pub const REMOTE_JOIN_CREDENTIAL_PATH: &str = "/etc/kubeadm-init.json";

#[derive(Clone, Debug)]
pub struct HostPaths {
    pub root_dir: RootDir,
    /// `/etc/fstab`
    pub fstab: FstabFile,
    /// `/etc/modules-load.d`
    pub modules_load_dir: ModulesLoadDir,
    /// `/etc/sysctl.d`
    pub sysctl_dir: SysctlDir,
    /// `/etc/apt/keyrings`
    pub keyring_dir: KeyringDir,
    /// `/etc/apt/sources.list.d`
    pub sources_dir: SourcesDir,
    /// `/usr/local/bin`
    pub bin_dir: BinDir,
    /// `/etc/kubeadm-init.json`
    pub join_credential: JoinCredentialFile,
    /// `/etc/containerd/config.toml`
    pub containerd_config: ContainerdConfigFile,
    /// `/etc/kubernetes/admin.conf`
    pub admin_kubeconfig: KubeconfigFile,
    /// `/etc/systemd/system`
    pub unit_dir: UnitDir,
    /// `/etc/ki.conf`
    pub service_options: ServiceOptionsFile,
    /// `/etc/ki`
    pub config_dir: ConfigDir,
}

impl HostPaths {
    /// The layout of the running host.
    pub fn system() -> Self {
        Self::from_root_dir(&RootDir::default())
    }

    pub fn from_root_dir(root: &RootDir) -> Self {
        let etc = root.0.clone().joined("etc");
        Self {
            root_dir: root.clone(),
            fstab: FstabFile(etc.join("fstab")),
            modules_load_dir: ModulesLoadDir(etc.join("modules-load.d")),
            sysctl_dir: SysctlDir(etc.join("sysctl.d")),
            keyring_dir: KeyringDir(etc.join("apt").joined("keyrings")),
            sources_dir: SourcesDir(etc.join("apt").joined("sources.list.d")),
            bin_dir: BinDir(root.0.join("usr").joined("local").joined("bin")),
            join_credential: JoinCredentialFile(etc.join("kubeadm-init.json")),
            containerd_config: ContainerdConfigFile(etc.join("containerd").joined("config.toml")),
            admin_kubeconfig: KubeconfigFile(etc.join("kubernetes").joined("admin.conf")),
            unit_dir: UnitDir(etc.join("systemd").joined("system")),
            service_options: ServiceOptionsFile(etc.join("ki.conf")),
            config_dir: ConfigDir(etc.joined("ki")),
        }
    }

    /// Where `name` would be found on a stock `PATH`, if it is installed at all.
    pub fn find_executable(&self, name: &str) -> Option<BinFile> {
        let usr_bin = BinDir(self.root_dir.0.join("usr").joined("bin"));
        let bin = BinDir(self.root_dir.0.join("bin"));
        [&self.bin_dir, &usr_bin, &bin]
            .into_iter()
            .map(|dir| dir.binary(name))
            .find(|file| file.is_file())
    }
}

#[doc(hidden)]
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = match path.parent() {
        Some(parent) if parent != Path::new("") => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::with_prefix_in(".ki-", dir)?;
    file.as_file().set_permissions(std::fs::Permissions::from_mode(mode))?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
