//! Template artifact key layout.
//!
//! Objects in the template bucket are keyed by build:
//!
//! ```text
//! <build_id>/memfile
//! <build_id>/rootfs.ext4
//! <build_id>/snapfile
//! <kernel_version>/vmlinux.bin
//! <firecracker_version>/firecracker
//! ```
//!
//! Local caches mirror the same coordinates under the templates directory,
//! with a cache generation and a per-instance component appended so that two
//! caches of the same build never share files.

use std::fmt;
use std::path::{Path, PathBuf};

use cinder_common::CinderResult;
use cinder_common::id::{short_hex, validate_component};
use serde::{Deserialize, Serialize};

/// Object name of the memory snapshot.
pub const MEMFILE_NAME: &str = "memfile";
/// Object name of the root filesystem image.
pub const ROOTFS_NAME: &str = "rootfs.ext4";
/// Object name of the snapshot metadata.
pub const SNAPFILE_NAME: &str = "snapfile";
/// Object name of the guest kernel.
pub const KERNEL_NAME: &str = "vmlinux.bin";
/// Object name of the hypervisor binary.
pub const FIRECRACKER_NAME: &str = "firecracker";

const MAX_COMPONENT_LEN: usize = 128;

/// The three artifacts a template build consists of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Guest memory snapshot.
    Memfile,
    /// Root filesystem image.
    Rootfs,
    /// Snapshot metadata.
    Snapfile,
}

impl ArtifactKind {
    /// All artifact kinds.
    pub const ALL: [Self; 3] = [Self::Memfile, Self::Rootfs, Self::Snapfile];

    /// Fixed object file name.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Memfile => MEMFILE_NAME,
            Self::Rootfs => ROOTFS_NAME,
            Self::Snapfile => SNAPFILE_NAME,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memfile => "memfile",
            Self::Rootfs => "rootfs",
            Self::Snapfile => "snapfile",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = cinder_common::CinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memfile" => Ok(Self::Memfile),
            "rootfs" | "rootfs.ext4" => Ok(Self::Rootfs),
            "snapfile" => Ok(Self::Snapfile),
            other => Err(cinder_common::CinderError::Config {
                message: format!("unknown artifact kind: {other}"),
            }),
        }
    }
}

/// Coordinates of one template build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateFiles {
    /// Template ID.
    pub template_id: String,
    /// Build ID.
    pub build_id: String,
    /// Guest kernel version.
    pub kernel_version: String,
    /// Firecracker version.
    pub firecracker_version: String,
}

impl TemplateFiles {
    /// Validate and build template coordinates.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any component cannot be used as a
    /// single path segment.
    pub fn new(
        template_id: impl Into<String>,
        build_id: impl Into<String>,
        kernel_version: impl Into<String>,
        firecracker_version: impl Into<String>,
    ) -> CinderResult<Self> {
        let files = Self {
            template_id: template_id.into(),
            build_id: build_id.into(),
            kernel_version: kernel_version.into(),
            firecracker_version: firecracker_version.into(),
        };

        validate_component("template ID", &files.template_id, MAX_COMPONENT_LEN)?;
        validate_component("build ID", &files.build_id, MAX_COMPONENT_LEN)?;
        validate_component("kernel version", &files.kernel_version, MAX_COMPONENT_LEN)?;
        validate_component(
            "firecracker version",
            &files.firecracker_version,
            MAX_COMPONENT_LEN,
        )?;

        Ok(files)
    }

    /// Bucket prefix holding the build's artifacts.
    #[must_use]
    pub fn storage_dir(&self) -> String {
        self.build_id.clone()
    }

    /// Object path of an artifact.
    #[must_use]
    pub fn storage_path(&self, kind: ArtifactKind) -> String {
        format!("{}/{}", self.storage_dir(), kind.file_name())
    }

    /// Object path of the memory snapshot.
    #[must_use]
    pub fn storage_memfile_path(&self) -> String {
        self.storage_path(ArtifactKind::Memfile)
    }

    /// Object path of the root filesystem image.
    #[must_use]
    pub fn storage_rootfs_path(&self) -> String {
        self.storage_path(ArtifactKind::Rootfs)
    }

    /// Object path of the snapshot metadata.
    #[must_use]
    pub fn storage_snapfile_path(&self) -> String {
        self.storage_path(ArtifactKind::Snapfile)
    }

    /// Object path of the guest kernel.
    #[must_use]
    pub fn storage_kernel_path(&self) -> String {
        format!("{}/{KERNEL_NAME}", self.kernel_version)
    }

    /// Object path of the hypervisor binary.
    #[must_use]
    pub fn storage_firecracker_path(&self) -> String {
        format!("{}/{FIRECRACKER_NAME}", self.firecracker_version)
    }

    /// Local cache layout for this build under `templates_dir`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `cache_identifier` is not a valid
    /// path segment.
    pub fn cache_files(
        &self,
        templates_dir: impl Into<PathBuf>,
        cache_identifier: impl Into<String>,
    ) -> CinderResult<TemplateCacheFiles> {
        let cache_identifier = cache_identifier.into();
        validate_component("cache identifier", &cache_identifier, MAX_COMPONENT_LEN)?;

        Ok(TemplateCacheFiles {
            files: self.clone(),
            templates_dir: templates_dir.into(),
            cache_identifier,
            instance: short_hex(),
        })
    }
}

impl fmt::Display for TemplateFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.template_id, self.build_id)
    }
}

/// Local cache locations for one template instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCacheFiles {
    files: TemplateFiles,
    templates_dir: PathBuf,
    cache_identifier: String,
    instance: String,
}

impl TemplateCacheFiles {
    /// Remote coordinates.
    #[must_use]
    pub const fn files(&self) -> &TemplateFiles {
        &self.files
    }

    /// Cache generation.
    #[must_use]
    pub fn cache_identifier(&self) -> &str {
        &self.cache_identifier
    }

    /// Directory holding this instance's cache files.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.templates_dir
            .join(&self.files.template_id)
            .join(&self.files.build_id)
            .join("cache")
            .join(&self.cache_identifier)
            .join(&self.instance)
    }

    /// Local cache file of an artifact.
    #[must_use]
    pub fn cache_path(&self, kind: ArtifactKind) -> PathBuf {
        self.cache_dir().join(kind.file_name())
    }

    /// Local cache file of the memory snapshot.
    #[must_use]
    pub fn cache_memfile_path(&self) -> PathBuf {
        self.cache_path(ArtifactKind::Memfile)
    }

    /// Local cache file of the root filesystem.
    #[must_use]
    pub fn cache_rootfs_path(&self) -> PathBuf {
        self.cache_path(ArtifactKind::Rootfs)
    }

    /// Local copy of the snapshot metadata.
    #[must_use]
    pub fn cache_snapfile_path(&self) -> PathBuf {
        self.cache_path(ArtifactKind::Snapfile)
    }

    /// Whether `path` lies inside this instance's cache directory.
    #[must_use]
    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(self.cache_dir())
    }
}
