//! Remote command and path construction.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;

/// Destination of `workload` inside `remote_directory`, keeping its base
/// file name. Returns `None` when the workload path has no file name.
pub(crate) fn remote_workload_path(
    remote_directory: &Utf8Path,
    workload: &Utf8Path,
) -> Option<Utf8PathBuf> {
    workload
        .file_name()
        .map(|file_name| remote_directory.join(file_name))
}

/// Builds `cd <dir> && <interpreter...> <remote_path>` with every word
/// shell-escaped.
pub(crate) fn build_command(
    remote_directory: &Utf8Path,
    interpreter: &str,
    remote_path: &Utf8Path,
) -> String {
    let invocation = interpreter
        .split_whitespace()
        .chain(std::iter::once(remote_path.as_str()))
        .map(|word| escape(word.into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let escaped_dir = escape(remote_directory.as_str().into());
    format!("cd {escaped_dir} && {invocation}")
}

/// Reads the local workload through a capability-scoped handle on its
/// directory.
///
/// The path is canonicalised first, so relative paths that climb out of the
/// working directory and symlinks to files elsewhere resolve to the real file.
pub(crate) fn read_workload(path: &Utf8Path) -> Result<Vec<u8>, String> {
    let resolved = path
        .canonicalize_utf8()
        .map_err(|err| format!("failed to resolve workload {path}: {err}"))?;
    let parent = resolved
        .parent()
        .ok_or_else(|| format!("workload has no parent directory: {resolved}"))?;
    let file_name = resolved
        .file_name()
        .ok_or_else(|| format!("workload has no file name: {resolved}"))?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| format!("failed to open {parent}: {err}"))?;
    dir.read(file_name)
        .map_err(|err| format!("failed to read workload {path}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/home/ubuntu", "scripts/test_train.py", Some("/home/ubuntu/test_train.py"))]
    #[case("/srv/jobs/", "/tmp/run.sh", Some("/srv/jobs/run.sh"))]
    #[case("/home/ubuntu", "/", None)]
    fn remote_path_keeps_base_name(
        #[case] dir: &str,
        #[case] workload: &str,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(
            remote_workload_path(Utf8Path::new(dir), Utf8Path::new(workload)),
            expected.map(Utf8PathBuf::from)
        );
    }

    #[test]
    fn command_changes_directory_then_invokes_interpreter() {
        let command = build_command(
            Utf8Path::new("/home/ubuntu"),
            "python3",
            Utf8Path::new("/home/ubuntu/test_train.py"),
        );
        assert_eq!(
            command,
            "cd /home/ubuntu && python3 /home/ubuntu/test_train.py"
        );
    }

    #[test]
    fn command_escapes_each_word() {
        let command = build_command(
            Utf8Path::new("/home/ubuntu/my jobs"),
            "python3 -u",
            Utf8Path::new("/home/ubuntu/my jobs/it's.py"),
        );
        assert_eq!(
            command,
            r"cd '/home/ubuntu/my jobs' && python3 -u '/home/ubuntu/my jobs/it'\''s.py'"
        );
    }

    fn write_job(dir: &Utf8Path, relative: &str) -> Utf8PathBuf {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create workload directory");
        }
        std::fs::write(&path, b"print('hi')\n").expect("write workload");
        path
    }

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        (dir, root)
    }

    /// Spells `target` relative to the working directory, climbing to the
    /// filesystem root with `..` components first.
    fn relative_to_cwd(target: &Utf8Path) -> Utf8PathBuf {
        let cwd = std::env::current_dir().expect("current dir");
        let depth = cwd.components().count().saturating_sub(1);
        let climb = "../".repeat(depth);
        Utf8PathBuf::from(format!("{climb}{}", target.as_str().trim_start_matches('/')))
    }

    #[test]
    fn read_workload_reads_absolute_paths() {
        let (_dir, root) = temp_root();
        let path = write_job(&root, "job.py");

        let contents = read_workload(&path).expect("workload should be readable");
        assert_eq!(contents, b"print('hi')\n");
    }

    #[test]
    fn read_workload_follows_parent_components() {
        let (_dir, root) = temp_root();
        let path = write_job(&root, "job.py");
        let relative = relative_to_cwd(&path);
        assert!(relative.starts_with(".."), "path should climb: {relative}");

        let contents = read_workload(&relative).expect("relative workload should be readable");
        assert_eq!(contents, b"print('hi')\n");
    }

    #[cfg(unix)]
    #[test]
    fn read_workload_follows_symlinks_out_of_the_directory() {
        let (_dir, root) = temp_root();
        let target = write_job(&root, "real/job.py");
        std::fs::create_dir_all(root.join("links")).expect("create link directory");
        let link = root.join("links/job.py");
        std::os::unix::fs::symlink(&target, &link).expect("create symlink");

        let contents = read_workload(&link).expect("symlinked workload should be readable");
        assert_eq!(contents, b"print('hi')\n");
    }

    #[test]
    fn read_workload_reports_missing_files() {
        let (_dir, root) = temp_root();
        let path = root.join("absent.py");

        let message = read_workload(&path).expect_err("missing file must fail");
        assert!(message.contains("absent.py"), "message: {message}");
    }
}
