use std::path::{Path, PathBuf};

/// Artifact file into which a pod's capture is written.
/// The capture tool may append rotation suffixes of its own.
pub fn capture_path(output_dir: &Path, pod_name: &str) -> PathBuf {
    output_dir.join(format!("capture-{pod_name}.pcap"))
}

/// Remove every artifact file of a pod, rotated ones included.
/// Individual removal failures are logged and skipped.
/// Returns the number of files actually removed.
pub fn remove_all(output_dir: &Path, pod_name: &str) -> usize {
    let pattern = format!("{}*", capture_path(output_dir, pod_name).display());

    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(error) => {
            tracing::warn!(%pattern, %error, "invalid capture artifact pattern");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(error) => {
                tracing::warn!(%error, "failed to walk capture artifacts");
                continue;
            }
        };
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to remove capture artifact");
            }
        }
    }
    removed
}

#[cfg(test)]
mod test {
    use super::{capture_path, remove_all};

    #[test]
    fn removes_only_matching_artifacts() {
        let dir = tempfile::tempdir().unwrap();

        for name in [
            "capture-web.pcap",
            "capture-web.pcap1",
            "capture-web.pcap12",
            "capture-webapp.pcap",
            "unrelated.txt",
        ] {
            std::fs::write(dir.path().join(name), b"pcap").unwrap();
        }

        assert_eq!(remove_all(dir.path(), "web"), 3);
        assert!(!capture_path(dir.path(), "web").exists());
        assert!(capture_path(dir.path(), "webapp").exists());
        assert!(dir.path().join("unrelated.txt").exists());

        // A second sweep finds nothing.
        assert_eq!(remove_all(dir.path(), "web"), 0);
    }

    #[test]
    fn missing_directory_sweeps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(remove_all(&dir.path().join("absent"), "web"), 0);
    }
}
