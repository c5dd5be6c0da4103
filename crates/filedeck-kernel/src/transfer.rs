//! Cross-backend transfer.
//!
//! Generic recursive copy between two drivers, written only against the
//! driver contract. Files stream straight from the source `read` into the
//! destination `write`. A failure stops the copy; whatever was created stays.

use futures::future::{BoxFuture, FutureExt};

use crate::vfs::{Driver, TreeNode, VfsResult};

/// Copy `src_id` into `dst_dir`, keeping the source name.
pub async fn copy_tree(
    src: &Driver,
    src_id: &str,
    dst: &Driver,
    dst_dir: &str,
) -> VfsResult<TreeNode> {
    let name = src.stat_required(src_id).await?.name;
    copy_tree_as(src, src_id, dst, dst_dir, &name).await
}

/// Copy `src_id` into `dst_dir` under `name`.
///
/// Children keep their own names; only the top-level entry is renamed.
#[tracing::instrument(
    skip(src, dst),
    fields(from = src.volume().id(), to = dst.volume().id()),
    name = "transfer.copy_tree"
)]
pub async fn copy_tree_as(
    src: &Driver,
    src_id: &str,
    dst: &Driver,
    dst_dir: &str,
    name: &str,
) -> VfsResult<TreeNode> {
    copy_node(src, src_id.to_string(), dst, dst_dir.to_string(), name.to_string()).await
}

fn copy_node<'a>(
    src: &'a Driver,
    src_id: String,
    dst: &'a Driver,
    dst_dir: String,
    name: String,
) -> BoxFuture<'a, VfsResult<TreeNode>> {
    async move {
        src.check_abort()?;
        dst.check_abort()?;
        let stat = src.stat_required(&src_id).await?;

        if !stat.is_dir() {
            let body = src.read(&src_id, None).await?;
            let id = dst.write(&dst_dir, &name, body).await?;
            return Ok(TreeNode {
                id,
                name,
                is_dir: false,
                children: Vec::new(),
            });
        }

        let id = dst.mkdir(&dst_dir, &name).await?;
        let mut children = Vec::new();
        for child in src.readdir(&src_id).await? {
            let Some(child_stat) = src.stat(&child).await? else {
                continue;
            };
            children.push(copy_node(src, child, dst, id.clone(), child_stat.name).await?);
        }
        Ok(TreeNode {
            id,
            name,
            is_dir: true,
            children,
        })
    }
    .boxed()
}
