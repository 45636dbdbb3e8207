//! Periodic self check of the repository.

use pool_config::{log_repo_debug, log_repo_warn};
use tracing::field::display;

use crate::fault::FaultAction;
use crate::repository::RepositoryInner;

impl RepositoryInner {
    /// Probe the metadata store, verify the ledger and shrink the pool if the
    /// file system lost free space to other users.
    pub(crate) fn check_health(&self) {
        if let Err(e) = self.store.check_health() {
            self.fail(
                FaultAction::ReadOnly,
                "Metadata store failed health check",
                Some(e.to_string()),
            );
            return;
        }

        if let Err(e) = self.account.check_invariants() {
            self.fail(
                FaultAction::Disabled,
                "Internal repository error: space accounting is inconsistent",
                Some(e.to_string()),
            );
            return;
        }

        let fs_free = match self.store.free_space() {
            Ok(free) => free,
            Err(e) => {
                log_repo_warn!("Failed to query free space", error = display(&e));
                return;
            }
        };
        let free = self.account.free_space();
        if fs_free < free {
            log_repo_warn!(
                "File system has less free space than the pool expects, adjusting pool size",
                fs_free = fs_free,
                pool_free = free
            );
            if let Err(e) = self.update_account_size() {
                log_repo_warn!("Failed to adjust pool size", error = display(&e));
            }
        } else {
            log_repo_debug!("Health check passed", fs_free = fs_free, pool_free = free);
        }
    }
}
