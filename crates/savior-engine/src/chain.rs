//! Backing-file chain reconstruction.
//!
//! Image files are named by bare image id. Each file's backing reference is
//! followed until a file without one is reached; the number of hops is the
//! file's depth and the file reached is its ancestor. Files sharing an
//! ancestor form one chain, ordered by depth, which has to come out dense and
//! without two files at the same position.

use crate::image::{ImageInfo, ImageTool};
use savior_common::{Result, SaviorError};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Image ids from base (index 0, no backing file) to leaf. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain(Vec<String>);

impl Chain {
    pub fn base(&self) -> &str {
        &self.0[0]
    }

    pub fn leaf(&self) -> &str {
        &self.0[self.0.len() - 1]
    }

    pub fn images(&self) -> &[String] {
        &self.0
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn position(&self, image: &str) -> Option<usize> {
        self.0.iter().position(|name| name == image)
    }

    /// Non-base images, leaf first. This is the only safe commit order.
    pub fn commit_order(&self) -> impl Iterator<Item = &str> {
        self.0.iter().skip(1).rev().map(String::as_str)
    }
}

/// Inspect every image file in `dir`.
///
/// Names containing a `.` (the settings file, `.tmp` leftovers) and anything
/// that is not a regular file are skipped.
pub async fn inspect_dir<T: ImageTool + ?Sized>(
    tool: &T,
    dir: &Path,
) -> Result<BTreeMap<String, ImageInfo>> {
    let mut images = BTreeMap::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains('.') || !entry.file_type().await?.is_file() {
            debug!(%name, "Skipping non-image entry");
            continue;
        }
        let info = tool.inspect(&entry.path()).await?;
        images.insert(name, info);
    }

    Ok(images)
}

/// Backing name per image, reduced to the final path component.
pub fn backing_map(images: &BTreeMap<String, ImageInfo>) -> BTreeMap<String, Option<String>> {
    images
        .iter()
        .map(|(name, info)| (name.clone(), info.backing_name().map(str::to_string)))
        .collect()
}

/// Inspect `dir` and reconstruct its chains, keyed by base image name.
pub async fn analyze_chains<T: ImageTool + ?Sized>(
    tool: &T,
    dir: &Path,
) -> Result<BTreeMap<String, Chain>> {
    let images = inspect_dir(tool, dir).await?;
    let chains = build_chains(&backing_map(&images))?;
    info!(
        dir = %dir.display(),
        images = images.len(),
        chains = chains.len(),
        "Analyzed backing-file chains"
    );
    Ok(chains)
}

/// Reconstruct chains from a name -> backing name map.
pub fn build_chains(backing: &BTreeMap<String, Option<String>>) -> Result<BTreeMap<String, Chain>> {
    let mut lineage: BTreeMap<String, (String, usize)> = BTreeMap::new();
    for name in backing.keys() {
        resolve_lineage(name, backing, &mut lineage)?;
    }

    let mut slots: BTreeMap<String, Vec<Option<String>>> = BTreeMap::new();
    for (name, (ancestor, depth)) in &lineage {
        let chain = slots.entry(ancestor.clone()).or_default();
        if chain.len() <= *depth {
            chain.resize(depth + 1, None);
        }
        if let Some(first) = &chain[*depth] {
            return Err(SaviorError::DuplicateDepth {
                ancestor: ancestor.clone(),
                depth: *depth,
                first: first.clone(),
                second: name.clone(),
            });
        }
        chain[*depth] = Some(name.clone());
    }

    let mut chains = BTreeMap::new();
    for (ancestor, chain) in slots {
        let images = chain
            .into_iter()
            .enumerate()
            .map(|(depth, slot)| {
                slot.ok_or_else(|| SaviorError::ChainGap {
                    ancestor: ancestor.clone(),
                    depth,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(%ancestor, ?images, "Chain");
        chains.insert(ancestor, Chain(images));
    }
    Ok(chains)
}

/// Walk from `name` to its base, filling `lineage` with (ancestor, depth) for
/// every file on the way.
fn resolve_lineage(
    name: &str,
    backing: &BTreeMap<String, Option<String>>,
    lineage: &mut BTreeMap<String, (String, usize)>,
) -> Result<()> {
    let mut path: Vec<String> = Vec::new();
    let mut current = name.to_string();

    let (ancestor, mut depth) = loop {
        if let Some((ancestor, depth)) = lineage.get(&current) {
            break (ancestor.clone(), *depth);
        }
        if path.contains(&current) {
            return Err(SaviorError::BackingCycle(current));
        }
        match backing.get(&current).cloned().flatten() {
            None => {
                lineage.insert(current.clone(), (current.clone(), 0));
                break (current, 0);
            }
            Some(next) => {
                if !backing.contains_key(&next) {
                    return Err(SaviorError::MissingBackingFile {
                        file: current,
                        backing: next,
                    });
                }
                path.push(std::mem::replace(&mut current, next));
            }
        }
    };

    for file in path.into_iter().rev() {
        depth += 1;
        lineage.insert(file, (ancestor.clone(), depth));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
        entries
            .iter()
            .map(|(name, backing)| (name.to_string(), backing.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_single_chain_in_any_order() {
        let chains = build_chains(&map(&[
            ("c", Some("b")),
            ("a", None),
            ("d", Some("c")),
            ("b", Some("a")),
        ]))
        .unwrap();

        assert_eq!(chains.len(), 1);
        let chain = &chains["a"];
        assert_eq!(chain.images(), ["a", "b", "c", "d"]);
        assert_eq!(chain.base(), "a");
        assert_eq!(chain.leaf(), "d");
        assert_eq!(chain.position("c"), Some(2));
    }

    #[test]
    fn test_independent_chains() {
        let chains = build_chains(&map(&[
            ("a", None),
            ("b", Some("a")),
            ("x", None),
            ("y", Some("x")),
            ("solo", None),
        ]))
        .unwrap();

        assert_eq!(chains.len(), 3);
        assert_eq!(chains["x"].images(), ["x", "y"]);
        assert_eq!(chains["solo"].len(), 1);
        assert_eq!(chains["solo"].commit_order().count(), 0);
    }

    #[test]
    fn test_missing_intermediate_is_fatal() {
        let err = build_chains(&map(&[("a", None), ("c", Some("b"))])).unwrap_err();
        assert!(matches!(
            err,
            SaviorError::MissingBackingFile { file, backing } if file == "c" && backing == "b"
        ));
    }

    #[test]
    fn test_duplicate_depth_is_fatal() {
        let err = build_chains(&map(&[
            ("a", None),
            ("b1", Some("a")),
            ("b2", Some("a")),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            SaviorError::DuplicateDepth { depth: 1, ref ancestor, .. } if ancestor == "a"
        ));
    }

    #[test]
    fn test_cycle_is_fatal() {
        let err = build_chains(&map(&[("a", Some("b")), ("b", Some("a"))])).unwrap_err();
        assert!(matches!(err, SaviorError::BackingCycle(_)));

        let err = build_chains(&map(&[("self", Some("self"))])).unwrap_err();
        assert!(matches!(err, SaviorError::BackingCycle(name) if name == "self"));
    }

    #[test]
    fn test_commit_order_is_leaf_first_without_base() {
        let chain = Chain(vec!["base".into(), "mid".into(), "leaf".into()]);
        let order: Vec<_> = chain.commit_order().collect();
        assert_eq!(order, ["leaf", "mid"]);
    }
}
