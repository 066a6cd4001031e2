// ABOUTME: Mount catalog for the shutdown unmount helper.
// ABOUTME: Loads the ordered mount list from the enumerator and answers child-relation queries.

use anyhow::{Context, Result};
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// A mount point path, compared purely by its bytes.
///
/// Mount points are not guaranteed to be UTF-8, so the raw bytes are kept and
/// handed to child processes unchanged. Only `Display` is lossy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountPath(Vec<u8>);

impl MountPath {
    pub fn new(path: impl Into<Vec<u8>>) -> Self {
        Self(path.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_os_str(&self) -> &OsStr {
        OsStr::from_bytes(&self.0)
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    /// True when `other` is mounted somewhere beneath `self`.
    ///
    /// `other` must extend `self` and the first byte after the shared prefix
    /// must be `/`, so `/mnt/ab` is not under `/mnt/a`. A path that already
    /// ends in `/` (the root mount) is the parent of any longer path that
    /// starts with it; the literal separator rule alone would leave `/` with
    /// no children at all.
    pub fn is_parent_of(&self, other: &MountPath) -> bool {
        let Some(rest) = other.0.strip_prefix(self.0.as_slice()) else {
            return false;
        };
        if rest.is_empty() {
            return false;
        }
        self.0.ends_with(b"/") || rest.starts_with(b"/")
    }
}

impl fmt::Display for MountPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl From<&str> for MountPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Mount points in teardown order: every sub-mount appears before its parent.
///
/// The ordering is produced by the enumerator and trusted as-is.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    paths: Vec<MountPath>,
}

impl Catalog {
    pub fn new(paths: Vec<MountPath>) -> Self {
        Self { paths }
    }

    /// Build a catalog from enumerator output, one path per line.
    pub fn parse(output: &[u8]) -> Self {
        let paths = output
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(MountPath::new)
            .collect();
        Self::new(paths)
    }

    /// Run the enumerator with the forwarded arguments and read its output.
    pub fn load(enumerator: &str, args: &[OsString]) -> Result<Self> {
        debug!(enumerator, ?args, "enumerating mount points");

        // The enumerator exits non-zero when nothing matched, so only the
        // output is meaningful.
        let output = Command::new(enumerator)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("failed to run {enumerator}, can't unmount anything"))?;

        let catalog = Self::parse(&output.stdout);
        info!(count = catalog.len(), "mount points to process");
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountPath> {
        self.paths.iter()
    }

    /// Indices of the entries before `index` that are mounted beneath it,
    /// nearest first.
    pub fn children_of(&self, index: usize) -> Vec<usize> {
        let Some(parent) = self.paths.get(index) else {
            return Vec::new();
        };
        (0..index)
            .rev()
            .filter(|&k| parent.is_parent_of(&self.paths[k]))
            .collect()
    }
}
