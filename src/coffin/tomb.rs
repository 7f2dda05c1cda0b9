//! # Epoch snapshot of a coffin.

use tokio_util::sync::CancellationToken;

use super::group::{Coffin, Epoch};
use crate::error::BoxError;

/// Dying/dead signals of one coffin epoch, obtained with [`Coffin::entomb`].
///
/// A tomb keeps observing the epoch it was taken from, even after the coffin
/// moved on to a new one.
#[derive(Clone)]
pub struct Tomb {
    coffin: Coffin,
    epoch: Epoch,
}

impl Tomb {
    pub(crate) fn new(coffin: Coffin, epoch: Epoch) -> Self {
        Self { coffin, epoch }
    }

    /// Resolves once the epoch starts dying.
    pub async fn dying(&self) {
        self.epoch.token.cancelled().await;
    }

    /// Resolves once every task of the epoch has returned.
    pub async fn dead(&self) {
        self.epoch.dead.cancelled().await;
    }

    /// True until the epoch starts dying.
    pub fn is_alive(&self) -> bool {
        !self.epoch.token.is_cancelled()
    }

    /// True once the epoch was killed or finished.
    pub fn is_dying(&self) -> bool {
        self.epoch.token.is_cancelled()
    }

    /// True once every task of the epoch has returned.
    pub fn is_dead(&self) -> bool {
        self.epoch.dead.is_cancelled()
    }

    /// Token of the epoch.
    pub fn token(&self) -> CancellationToken {
        self.epoch.token.clone()
    }

    /// Kills the owning coffin, see [`Coffin::kill`].
    pub fn kill(&self, reason: Option<BoxError>) {
        self.coffin.kill(reason);
    }
}

impl std::fmt::Debug for Tomb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tomb")
            .field("dying", &self.is_dying())
            .field("dead", &self.is_dead())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn tomb_follows_its_epoch() {
        let coffin = Coffin::new();
        coffin.go_with_token("waiter", |ctx| async move {
            ctx.cancelled().await;
            Ok::<(), BoxError>(())
        });
        let tomb = coffin.entomb();
        assert!(tomb.is_alive());

        tomb.kill(None);
        timeout(Duration::from_secs(5), tomb.dying()).await.expect("dying");
        timeout(Duration::from_secs(5), tomb.dead()).await.expect("dead");
        assert!(tomb.is_dead());

        // a new epoch does not revive the old tomb
        coffin.go("next", || async { Ok::<(), BoxError>(()) });
        assert!(tomb.is_dying());
        coffin.wait().await.expect("next epoch");
    }
}
