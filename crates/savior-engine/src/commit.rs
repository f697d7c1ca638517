//! Flattening of downloaded chains into their base images.

use crate::chain::{backing_map, build_chains, inspect_dir, Chain};
use crate::image::ImageTool;
use savior_common::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Commit every chain in `dir` into its base image.
///
/// Backing references are first rewritten to bare sibling names so that each
/// file resolves its parent inside `dir`, wherever the files were downloaded
/// from. Each chain is then committed leaf to root; the base is never
/// committed. The first failure aborts the whole directory and files already
/// committed stay committed.
#[instrument(skip(tool), fields(dir = %dir.display()))]
pub async fn commit_chains<T: ImageTool + ?Sized>(
    tool: &T,
    dir: &Path,
) -> Result<BTreeMap<String, Chain>> {
    info!("Beginning commits of disk chains");
    let images = inspect_dir(tool, dir).await?;
    let chains = build_chains(&backing_map(&images))?;

    for (name, info) in &images {
        let (Some(stored), Some(parent)) = (info.backing_file.as_deref(), info.backing_name())
        else {
            continue;
        };
        if stored == parent {
            continue;
        }
        let format = images
            .get(parent)
            .map(|backing| backing.format.as_str())
            .unwrap_or("qcow2");
        debug!(image = %name, from = stored, to = parent, "Rebasing onto sibling");
        tool.rebase(&dir.join(name), parent, format).await?;
    }

    for (base, chain) in &chains {
        info!(base = %base, images = chain.len(), "Committing chain");
        for image in chain.commit_order() {
            debug!(image, "Committing");
            tool.commit(&dir.join(image)).await?;
        }
    }

    info!(chains = chains.len(), "All chains committed");
    Ok(chains)
}
