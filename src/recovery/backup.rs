use std::path::Path;

use anyhow::Context as _;

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("create dir: {}", dst.display()))?;
    for entry in
        std::fs::read_dir(src).with_context(|| format!("read dir: {}", src.display()))?
    {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).with_context(|| {
                format!("copy {} -> {}", from.display(), to.display())
            })?;
        }
    }
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove dir: {}", path.display())),
    }
}

/// Replaces `dst` with a copy of `src` (or an empty dir if `src` is missing).
///
/// The copy is staged next to `dst` and swapped in with renames, so `dst` is
/// either the old tree or the complete new one.
pub fn replace_dir_atomic(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let parent = dst
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", dst.display()))?;
    let name = dst
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", dst.display()))?
        .to_string_lossy()
        .to_string();
    let token = uuid::Uuid::new_v4().simple().to_string();
    let staging = parent.join(format!(".{name}.restore.{token}"));
    let retired = parent.join(format!(".{name}.old.{token}"));

    let staged = if src.is_dir() {
        copy_dir_recursive(src, &staging)
    } else {
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("create dir: {}", staging.display()))
    };
    if let Err(err) = staged {
        let _ = remove_dir_if_exists(&staging);
        return Err(err.context(format!("stage restore of {}", dst.display())));
    }

    let had_existing = dst.exists();
    if had_existing {
        std::fs::rename(dst, &retired)
            .with_context(|| format!("retire {}", dst.display()))?;
    }
    if let Err(err) = std::fs::rename(&staging, dst) {
        if had_existing {
            let _ = std::fs::rename(&retired, dst);
        }
        let _ = remove_dir_if_exists(&staging);
        return Err(err).with_context(|| format!("swap in restored {}", dst.display()));
    }
    if had_existing {
        remove_dir_if_exists(&retired)?;
    }
    Ok(())
}
