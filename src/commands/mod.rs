pub mod extend;
pub mod init;
pub mod release;
pub mod reservations;
pub mod reserve;
pub mod sweep;
pub mod wait;

use std::path::Path;

use crate::error::Result;
use crate::workspace::Workspace;

/// Open the workspace, run `op` and commit whether or not `op` succeeded.
/// Failed operations leave the table untouched, but the load-time sweep and
/// any violation events they filed still have to be written back.
pub(crate) fn with_workspace<T>(
    state_dir: &Path,
    op: impl FnOnce(&Workspace) -> Result<T>,
) -> Result<T> {
    let workspace = Workspace::open(state_dir)?;
    let outcome = op(&workspace);
    workspace.commit()?;
    outcome
}
