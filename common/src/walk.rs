use anyhow::Context;
use async_recursion::async_recursion;

use crate::glob::{IgnoreSet, PatternList};
use crate::provider::{EntryKind, SyncProvider, TreeEntry};

// deep enough for any sane tree; a symlink cycle under `follow_links`
// would otherwise recurse until the path length blows up
const MAX_DEPTH: usize = 64;

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Walks the provider tree depth-first and returns every non-ignored entry,
/// sorted by relative path.
///
/// Ignored directories are pruned before recursion, so nothing below them is
/// visited. With `follow_links` each symlink is resolved and reported as its
/// target kind; unresolvable links are skipped with a warning. A subdirectory
/// that cannot be listed is skipped with a warning, an unlistable root is an
/// error. Recursion stops at [`MAX_DEPTH`] so a symlink cycle cannot walk
/// forever.
pub async fn walk(
    provider: &dyn SyncProvider,
    ignore: &IgnoreSet,
    follow_links: bool,
) -> anyhow::Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    walk_dir(provider, "", ignore, follow_links, 0, &mut entries).await?;
    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

#[async_recursion]
async fn walk_dir(
    provider: &dyn SyncProvider,
    dir: &str,
    ignore: &IgnoreSet,
    follow_links: bool,
    depth: usize,
    out: &mut Vec<TreeEntry>,
) -> anyhow::Result<()> {
    let children = match provider.list(dir).await {
        Ok(children) => children,
        Err(error) if depth == 0 => {
            return Err(error)
                .with_context(|| format!("cannot list root of {}", provider.name()));
        }
        Err(error) => {
            tracing::warn!(
                "skipping unreadable directory {:?} on {}: {:#}",
                dir,
                provider.name(),
                anyhow::Error::from(error)
            );
            return Ok(());
        }
    };
    for child in children {
        if child.name == "." || child.name == ".." {
            continue;
        }
        let rel_path = join_rel(dir, &child.name);
        let mut stat = child.stat;
        if follow_links && stat.kind == EntryKind::Symlink {
            match provider.stat_resolved(&rel_path).await {
                Ok(resolved) => stat = resolved,
                Err(error) => {
                    tracing::warn!(
                        "skipping unresolvable symlink {:?}: {:#}",
                        rel_path,
                        anyhow::Error::from(error)
                    );
                    continue;
                }
            }
        }
        if stat.kind == EntryKind::Directory {
            if ignore.is_ignored(&rel_path, true) {
                tracing::debug!("pruning ignored directory {:?}", rel_path);
                continue;
            }
            if depth + 1 >= MAX_DEPTH {
                tracing::warn!(
                    "not descending into {:?}, max depth reached (symlink cycle?)",
                    rel_path
                );
                continue;
            }
            out.push(TreeEntry::from_stat(rel_path.clone(), stat));
            walk_dir(provider, &rel_path, ignore, follow_links, depth + 1, out).await?;
        } else {
            if ignore.is_ignored(&rel_path, false) {
                tracing::debug!("ignoring {:?}", rel_path);
                continue;
            }
            out.push(TreeEntry::from_stat(rel_path, stat));
        }
    }
    Ok(())
}

/// Selection-list variant of [`walk`]: keeps files and symlinks matched by
/// an inclusion pattern plus the ancestor directories needed to create them,
/// preserving the sorted parent-before-child order.
pub async fn walk_select(
    provider: &dyn SyncProvider,
    patterns: &PatternList,
    follow_links: bool,
) -> anyhow::Result<Vec<TreeEntry>> {
    let all = walk(provider, &IgnoreSet::default(), follow_links).await?;
    let mut needed = std::collections::HashSet::new();
    for entry in &all {
        if entry.kind != EntryKind::Directory && patterns.matches(&entry.rel_path) {
            needed.insert(entry.rel_path.clone());
            let mut ancestor = entry.rel_path.as_str();
            while let Some(pos) = ancestor.rfind('/') {
                ancestor = &ancestor[..pos];
                needed.insert(ancestor.to_string());
            }
        }
    }
    Ok(all
        .into_iter()
        .filter(|entry| needed.contains(&entry.rel_path))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFs;
    use crate::testutils;
    use anyhow::Result;
    use tracing_test::traced_test;

    fn rel_paths(entries: &[TreeEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.rel_path.as_str()).collect::<Vec<_>>()
    }

    #[tokio::test]
    #[traced_test]
    async fn walk_is_sorted_and_complete() -> Result<()> {
        let tmp_dir = testutils::setup_test_tree().await?;
        let fs = LocalFs::new(&tmp_dir);
        let entries = walk(&fs, &IgnoreSet::default(), false).await?;
        assert_eq!(
            rel_paths(&entries),
            vec!["0.txt", "bar", "bar/1.txt", "bar/2.txt", "baz", "baz/3.txt", "baz/4.txt"]
        );
        assert!(entries.iter().all(|e| !e.rel_path.contains("./")));
        let link = entries.iter().find(|e| e.rel_path == "baz/4.txt").unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn ignored_directory_is_pruned() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        tokio::fs::create_dir_all(tmp_dir.join("a/b")).await?;
        tokio::fs::write(tmp_dir.join("a/b/c.txt"), "c").await?;
        let fs = LocalFs::new(&tmp_dir);
        let entries = walk(&fs, &IgnoreSet::new(["a/b/"]), false).await?;
        assert_eq!(rel_paths(&entries), vec!["a"]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn ignore_matches_files_too() -> Result<()> {
        let tmp_dir = testutils::setup_test_tree().await?;
        let fs = LocalFs::new(&tmp_dir);
        let entries = walk(&fs, &IgnoreSet::new(["*.txt"]), false).await?;
        assert_eq!(rel_paths(&entries), vec!["bar", "baz"]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn follow_links_resolves_kind() -> Result<()> {
        let tmp_dir = testutils::setup_test_tree().await?;
        let fs = LocalFs::new(&tmp_dir);
        let entries = walk(&fs, &IgnoreSet::default(), true).await?;
        let link = entries.iter().find(|e| e.rel_path == "baz/4.txt").unwrap();
        assert_eq!(link.kind, EntryKind::File);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn follow_links_skips_dangling() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        tokio::fs::symlink("no-such-target", tmp_dir.join("dangling")).await?;
        tokio::fs::write(tmp_dir.join("real.txt"), "x").await?;
        let fs = LocalFs::new(&tmp_dir);
        let entries = walk(&fs, &IgnoreSet::default(), true).await?;
        assert_eq!(rel_paths(&entries), vec!["real.txt"]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn follow_links_survives_symlink_cycle() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        tokio::fs::write(tmp_dir.join("real.txt"), "x").await?;
        // a link back to its own parent would recurse forever
        tokio::fs::symlink(".", tmp_dir.join("cycle")).await?;
        let fs = LocalFs::new(&tmp_dir);
        let entries = walk(&fs, &IgnoreSet::default(), true).await?;
        assert!(entries.iter().any(|e| e.rel_path == "real.txt"));
        // bounded output, sorted, no duplicates
        assert!(entries.len() < 3 * MAX_DEPTH);
        for pair in entries.windows(2) {
            assert!(pair[0].rel_path < pair[1].rel_path);
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn select_keeps_ancestor_directories() -> Result<()> {
        let tmp_dir = testutils::setup_test_tree().await?;
        let fs = LocalFs::new(&tmp_dir);
        let entries = walk_select(&fs, &PatternList::new(["bar/*.txt"]), false).await?;
        assert_eq!(rel_paths(&entries), vec!["bar", "bar/1.txt", "bar/2.txt"]);
        Ok(())
    }
}
