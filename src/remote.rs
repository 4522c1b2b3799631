use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

static REMOTE_HOST: OnceLock<Option<String>> = OnceLock::new();

/// Record the target host for this process. Later calls are ignored.
pub fn set_remote_host(host: Option<String>) {
    let _ = REMOTE_HOST.set(host);
}

pub fn remote_host() -> Option<&'static str> {
    REMOTE_HOST.get().and_then(|host| host.as_deref())
}

/// Rewrite a shell command so it runs on the configured remote host, or
/// return it unchanged when no host is configured.
pub fn wrap(command: &str) -> String {
    wrap_for(remote_host(), command)
}

fn wrap_for(host: Option<&str>, command: &str) -> String {
    match host {
        Some(host) => format!("ssh {} \"{}\"", host, command.replace('"', "\\\"")),
        None => command.to_string(),
    }
}

/// Materialise a directory tree at `dest`: recursive copy locally, `scp -r`
/// when a remote host is configured. A `~/` prefix on `dest` is stripped
/// before remote copy so the path resolves inside the remote home.
pub fn send(src: &Path, dest: &Path) -> Result<()> {
    match remote_host() {
        Some(host) => {
            let dest = remote_dest(dest);
            let status = Command::new("scp")
                .arg("-r")
                .arg(src)
                .arg(format!("{host}:{dest}"))
                .status()
                .with_context(|| format!("spawning scp for {}", src.display()))?;
            if !status.success() {
                anyhow::bail!(
                    "copying {} to {}:{} failed with {}",
                    src.display(),
                    host,
                    dest,
                    status
                );
            }
            Ok(())
        }
        None => copy_dir_recursive(src, dest),
    }
}

fn remote_dest(dest: &Path) -> String {
    let raw = dest.to_string_lossy();
    raw.strip_prefix("~/").unwrap_or(raw.as_ref()).to_string()
}

pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("creating directory {}", dest.display()))?;
    for entry in
        fs::read_dir(src).with_context(|| format!("reading directory {}", src.display()))?
    {
        let entry = entry.with_context(|| format!("reading directory {}", src.display()))?;
        let target = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("inspecting {}", entry.path().display()))?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn wrap_is_identity_without_a_host() {
        assert_eq!(wrap_for(None, "installpkg /tmp/foo.tgz"), "installpkg /tmp/foo.tgz");
    }

    #[test]
    fn wrap_quotes_the_command_for_ssh() {
        assert_eq!(
            wrap_for(Some("builder"), "ls /var/lib/pkgtools/packages"),
            "ssh builder \"ls /var/lib/pkgtools/packages\""
        );
        assert_eq!(
            wrap_for(Some("builder"), "echo \"hi\""),
            "ssh builder \"echo \\\"hi\\\"\""
        );
    }

    #[test]
    fn remote_dest_strips_home_prefix() {
        assert_eq!(remote_dest(&PathBuf::from("~/.sboforge/bots/00")), ".sboforge/bots/00");
        assert_eq!(remote_dest(&PathBuf::from("/srv/work")), "/srv/work");
    }

    #[test]
    fn copy_dir_recursive_copies_nested_trees() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).expect("create nested dir");
        fs::write(src.join("a.txt"), "a").expect("write a");
        fs::write(src.join("nested/b.txt"), "b").expect("write b");

        let dest = tmp.path().join("dest");
        copy_dir_recursive(&src, &dest).expect("copy tree");

        assert_eq!(fs::read_to_string(dest.join("a.txt")).expect("read a"), "a");
        assert_eq!(
            fs::read_to_string(dest.join("nested/b.txt")).expect("read b"),
            "b"
        );
    }
}
