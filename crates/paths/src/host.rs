use crate::path_type;
use crate::utils::PathBufExt;

path_type!(FstabFile: file);

path_type!(ModulesLoadDir: dir);

impl ModulesLoadDir {
    /// The autoload list for `profile`, e.g. `containerd.conf`.
    pub fn profile(&self, profile: &str) -> ModulesProfileFile {
        ModulesProfileFile(self.0.clone().joined_conf(profile))
    }
}

path_type!(ModulesProfileFile: file);

path_type!(SysctlDir: dir);

impl SysctlDir {
    pub fn profile(&self, profile: &str) -> SysctlProfileFile {
        SysctlProfileFile(self.0.clone().joined_conf(profile))
    }
}

path_type!(SysctlProfileFile: file);

path_type! {
    /// Dearmored package signing keys, referenced from repository definitions via `signed-by`.
    KeyringDir: dir
}

impl KeyringDir {
    pub fn keyring(&self, name: &str) -> KeyringFile {
        KeyringFile(self.0.join(format!("{name}.gpg")))
    }
}

path_type!(KeyringFile: file);

path_type!(SourcesDir: dir);

impl SourcesDir {
    pub fn source_list(&self, name: &str) -> SourceListFile {
        SourceListFile(self.0.join(format!("{name}.list")))
    }
}

path_type!(SourceListFile: file);

path_type!(BinDir: dir);

impl BinDir {
    pub fn binary(&self, name: &str) -> BinFile {
        BinFile(self.0.join(name))
    }
}

path_type!(BinFile: file);

path_type! {
    /// The JSON join credential written by the control plane.
    JoinCredentialFile: file
}

path_type!(ContainerdConfigFile: file);

path_type!(KubeconfigFile: file);

path_type!(UnitDir: dir);

impl UnitDir {
    pub fn unit(&self, name: &str) -> UnitFile {
        UnitFile(self.0.join(name))
    }
}

path_type!(UnitFile: file);

path_type! {
    /// `KEY=value` environment file consumed by the bootstrap service unit.
    ServiceOptionsFile: file
}

path_type!(ConfigDir: dir);

impl ConfigDir {
    pub fn config_toml(&self) -> ConfigTomlFile {
        ConfigTomlFile(self.0.join("config.toml"))
    }
    pub fn log_conf(&self) -> LogConfFile {
        LogConfFile(self.0.join("log.conf"))
    }
    pub fn cni_values(&self) -> ValuesFile {
        ValuesFile(self.0.join("cilium-values.yaml"))
    }
}

path_type!(ConfigTomlFile: file);
path_type!(LogConfFile: file);

path_type! {
    /// A chart values document handed to the chart installer.
    ValuesFile: file
}
