use std::borrow::BorrowMut;
use std::path::{Path, PathBuf};

pub(crate) trait PathBufExt: BorrowMut<PathBuf> + Sized {
    fn joined<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.borrow_mut().push(path);
        self
    }
    /// Append `<profile>.conf`, the naming used by the `*.d` drop-in directories.
    fn joined_conf(self, profile: &str) -> Self {
        self.joined(format!("{profile}.conf"))
    }
}

impl PathBufExt for PathBuf {}

/// Declares a typed host path.
///
/// The type derefs to [`Path`], so read-only queries (`exists`, `metadata`, `display`, ...)
/// come from the standard library. The `file` arm adds reads and the atomic write the
/// bootstrap steps go through.
///
/// ```
/// # use ki_paths::path_type;
/// path_type! {
///     /// optional docs
///     DropInDir: dir // or file
/// }
/// ```
#[macro_export]
macro_rules! path_type {
    ($(#[doc = $doc:literal])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Clone, Debug, PartialEq, Eq, $crate::__serde::Serialize, $crate::__serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub std::path::PathBuf);

        impl std::ops::Deref for $name {
            type Target = std::path::Path;
            #[inline]
            fn deref(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl AsRef<std::path::Path> for $name {
            #[inline]
            fn as_ref(&self) -> &std::path::Path {
                &self.0
            }
        }

        // Lets clap parse the type straight from argv.
        impl From<std::ffi::OsString> for $name {
            fn from(s: std::ffi::OsString) -> Self {
                Self(s.into())
            }
        }
    };
    // Directories are only ever joined onto; their files create them on write.
    ($(#[doc = $doc:literal])* $name:ident: dir) => {
        $crate::path_type!($(#[doc = $doc])* $name);
    };
    ($(#[doc = $doc:literal])* $name:ident: file) => {
        $crate::path_type!($(#[doc = $doc])* $name);
        impl $name {
            pub fn read(&self) -> std::io::Result<Vec<u8>> {
                std::fs::read(&self.0)
            }

            pub fn read_to_string(&self) -> std::io::Result<String> {
                std::fs::read_to_string(&self.0)
            }

            /// Replace the contents of this file, creating the parent directory if needed.
            ///
            /// The new contents are written to a sibling temporary file carrying `mode`
            /// and then renamed over the target, so readers never observe a partial write.
            pub fn write_atomic(&self, contents: impl AsRef<[u8]>, mode: u32) -> std::io::Result<()> {
                self.create_parent()?;
                $crate::write_atomic(&self.0, contents.as_ref(), mode)
            }

            pub fn create_parent(&self) -> std::io::Result<()> {
                match self.0.parent() {
                    Some(parent) if parent != std::path::Path::new("") => std::fs::create_dir_all(parent),
                    _ => Ok(()),
                }
            }
        }
    };
}
