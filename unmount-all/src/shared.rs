// ABOUTME: Detection of propagation-shared mounts.
// ABOUTME: Parses a mountinfo table and collects mount points carrying a "shared:" peer group tag.

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

use crate::catalog::MountPath;

/// Mount points whose unmount events propagate across namespaces.
#[derive(Debug, Clone, Default)]
pub struct SharedMountSet {
    paths: HashSet<MountPath>,
}

impl SharedMountSet {
    pub fn contains(&self, path: &MountPath) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Parse the `/proc/<pid>/mountinfo` format.
    /// Each line looks like:
    ///   36 35 98:0 /mnt1 /mnt2 rw,noatime shared:1 master:2 - ext3 /dev/root rw
    /// Optional fields sit between the mount options and the lone `-`.
    pub fn parse(content: &[u8]) -> Self {
        let mut paths = HashSet::new();

        for line in content.split(|&b| b == b'\n') {
            let fields: Vec<&[u8]> = line
                .split(u8::is_ascii_whitespace)
                .filter(|f| !f.is_empty())
                .collect();
            if fields.len() < 7 {
                continue;
            }

            let is_shared = fields[6..]
                .iter()
                .take_while(|&&f| f != b"-")
                .any(|f| f.starts_with(b"shared:"));

            if is_shared {
                paths.insert(MountPath::new(unescape(fields[4])));
            }
        }

        Self { paths }
    }

    /// Read the shared set from a mountinfo file. Only Linux has shared
    /// propagation, so other platforms always get an empty set.
    #[cfg(target_os = "linux")]
    pub fn load(mountinfo: &Path) -> Result<Self> {
        use anyhow::Context;

        let content = std::fs::read(mountinfo)
            .with_context(|| format!("failed to read {}", mountinfo.display()))?;
        let set = Self::parse(&content);
        tracing::debug!(count = set.len(), "shared mounts");
        Ok(set)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn load(_mountinfo: &Path) -> Result<Self> {
        Ok(Self::default())
    }
}

impl FromIterator<MountPath> for SharedMountSet {
    fn from_iter<I: IntoIterator<Item = MountPath>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

/// Decode the octal escapes mountinfo uses for whitespace and backslashes
/// (e.g. `\040` for a space).
fn unescape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:6 / /dev rw,nosuid,relatime shared:2 - devtmpfs udev rw,size=4096k
24 22 0:7 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw
25 22 8:2 / /home rw,relatime master:4 - ext4 /dev/sda2 rw
26 22 8:3 / /srv rw,relatime master:5 shared:9 - ext4 /dev/sda3 rw
";

    #[test]
    fn parse_collects_shared_mounts() {
        let set = SharedMountSet::parse(MOUNTINFO.as_bytes());
        assert_eq!(set.len(), 3);
        assert!(set.contains(&MountPath::from("/")));
        assert!(set.contains(&MountPath::from("/dev")));
        assert!(set.contains(&MountPath::from("/srv")));
    }

    #[test]
    fn parse_skips_private_and_slave_mounts() {
        let set = SharedMountSet::parse(MOUNTINFO.as_bytes());
        assert!(!set.contains(&MountPath::from("/proc")));
        assert!(!set.contains(&MountPath::from("/home")));
    }

    #[test]
    fn shared_tag_after_separator_is_ignored() {
        let set = SharedMountSet::parse(b"30 22 0:9 / /weird rw - shared:fs src rw\n");
        assert!(set.is_empty());
    }

    #[test]
    fn parse_decodes_escaped_mount_point() {
        let set = SharedMountSet::parse(
            b"40 22 8:4 / /media/usb\\040stick rw shared:12 - vfat /dev/sdb1 rw\n",
        );
        assert!(set.contains(&MountPath::from("/media/usb stick")));
    }

    #[test]
    fn parse_ignores_short_lines() {
        assert!(SharedMountSet::parse(b"garbage\n\n1 2 3\n").is_empty());
    }

    #[test]
    fn unescape_leaves_plain_paths_alone() {
        assert_eq!(unescape(b"/home/user"), b"/home/user");
        assert_eq!(unescape(b"/a\\b"), b"/a\\b");
        assert_eq!(unescape(b"/tab\\011x"), b"/tab\tx");
        assert_eq!(unescape(b"/back\\134slash"), b"/back\\slash");
    }

    #[test]
    fn unescape_keeps_non_utf8_bytes() {
        assert_eq!(unescape(b"/mnt/caf\\351"), b"/mnt/caf\xe9");
    }

    #[test]
    fn parse_matches_non_utf8_mount_point() {
        let set =
            SharedMountSet::parse(b"41 22 8:5 / /mnt/caf\xe9 rw shared:3 - ext4 /dev/sdc1 rw\n");
        assert!(set.contains(&MountPath::new(b"/mnt/caf\xe9".to_vec())));
        assert!(!set.contains(&MountPath::from("/mnt/caf\u{e9}")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mountinfo");
        std::fs::write(&file, MOUNTINFO).unwrap();

        let set = SharedMountSet::load(&file).unwrap();
        assert_eq!(set.len(), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn load_reads_escaped_non_utf8_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mountinfo");
        std::fs::write(&file, "42 22 8:6 / /mnt/caf\\351 rw shared:4 - ext4 /dev/sdd1 rw\n")
            .unwrap();

        let set = SharedMountSet::load(&file).unwrap();
        assert!(set.contains(&MountPath::new(b"/mnt/caf\xe9".to_vec())));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn load_missing_file_fails() {
        assert!(SharedMountSet::load(Path::new("/nonexistent/mountinfo")).is_err());
    }
}
