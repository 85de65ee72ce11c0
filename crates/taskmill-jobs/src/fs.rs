//! Scratch directory bodies.

use std::sync::Arc;

use anyhow::Context;
use taskmill_scheduler::{body_fn, JobBody, JobContext};
use tracing::info;

/// Create `temp_dir` (argument 0) and any missing parents. Succeeds when it
/// already exists.
pub fn mkdir() -> Arc<dyn JobBody> {
    body_fn(|ctx: JobContext| async move {
        let dir = ctx.str_param(0, "temp_dir")?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create directory {dir}"))?;
        info!(job = %ctx.job_name, dir, "directory created");
        Ok(())
    })
}

/// Remove `temp_dir` (argument 0) with everything in it.
pub fn rmdir() -> Arc<dyn JobBody> {
    body_fn(|ctx: JobContext| async move {
        let dir = ctx.str_param(0, "temp_dir")?;
        tokio::fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("cannot remove directory {dir}"))?;
        info!(job = %ctx.job_name, dir, "directory removed");
        Ok(())
    })
}
