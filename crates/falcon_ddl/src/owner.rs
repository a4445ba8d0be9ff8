//! DDL owner election.
//!
//! Exactly one node executes jobs at a time. Ownership is a lease kept in
//! the metadata store: the holder renews it periodically, and any other node
//! may take over once it expires. Each takeover bumps a fencing term; every
//! step transaction reads the term, so a deposed owner's in-flight commit
//! fails instead of clobbering its successor's work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use falcon_common::error::{ClusterError, FalconResult};
use falcon_common::types::NodeId;

use crate::meta::{MetaKey, MetaStore};
use crate::txn::MetaTxn;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fencing record. Rewritten only when ownership changes hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerTerm {
    pub node_id: NodeId,
    pub term: u64,
}

/// Lease record. Rewritten on every renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerLease {
    pub node_id: NodeId,
    pub term: u64,
    pub expires_at_ms: u64,
}

/// Leader election for the DDL owner role.
#[async_trait]
pub trait OwnerElection: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    /// Try to become owner. Returns whether this node holds the lease.
    async fn try_acquire(&self) -> FalconResult<bool>;

    /// Extend the lease. Fails if ownership was lost.
    async fn renew(&self) -> FalconResult<()>;

    /// Give up ownership voluntarily.
    async fn resign(&self) -> FalconResult<()>;

    fn is_owner(&self) -> bool;

    /// Ownership flag; flips to `false` when ownership is lost.
    fn watch_ownership(&self) -> watch::Receiver<bool>;

    /// Add the fencing check to a step transaction.
    async fn fence(&self, _txn: &mut MetaTxn) -> FalconResult<()> {
        if self.is_owner() {
            Ok(())
        } else {
            Err(ClusterError::NotOwner(self.node_id()).into())
        }
    }
}

/// [`OwnerElection`] backed by lease records in the metadata store.
pub struct StoreLeaseElection {
    node_id: NodeId,
    store: Arc<dyn MetaStore>,
    lease: Duration,
    term: AtomicU64,
    owner: watch::Sender<bool>,
}

impl StoreLeaseElection {
    pub fn new(node_id: NodeId, store: Arc<dyn MetaStore>, lease: Duration) -> Self {
        let (owner, _) = watch::channel(false);
        Self {
            node_id,
            store,
            lease,
            term: AtomicU64::new(0),
            owner,
        }
    }

    /// Fencing term held by this node (0 when not owner).
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    fn set_owner(&self, owner: bool) {
        let was = self.owner.send_replace(owner);
        if was != owner {
            falcon_observability::record_ddl_owner(owner);
            if owner {
                tracing::info!(node = %self.node_id, term = self.term(), "became DDL owner");
            } else {
                tracing::warn!(node = %self.node_id, "lost DDL ownership");
            }
        }
    }

    fn lose(&self) -> ClusterError {
        self.term.store(0, Ordering::SeqCst);
        self.set_owner(false);
        ClusterError::OwnerLost(self.node_id)
    }
}

#[async_trait]
impl OwnerElection for StoreLeaseElection {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn try_acquire(&self) -> FalconResult<bool> {
        let now = now_millis();
        let mut txn = MetaTxn::new(self.store.clone());
        let lease: Option<OwnerLease> = txn.get(&MetaKey::OwnerLease).await?;
        let term: Option<OwnerTerm> = txn.get(&MetaKey::OwnerTerm).await?;
        let current_term = term.map(|t| t.term).unwrap_or(0);

        let new_term = match lease {
            Some(l) if l.node_id == self.node_id && l.term == current_term => current_term,
            Some(l) if l.expires_at_ms > now => return Ok(false),
            _ => current_term + 1,
        };
        if new_term != current_term {
            txn.put(
                MetaKey::OwnerTerm,
                &OwnerTerm {
                    node_id: self.node_id,
                    term: new_term,
                },
            )?;
        }
        txn.put(
            MetaKey::OwnerLease,
            &OwnerLease {
                node_id: self.node_id,
                term: new_term,
                expires_at_ms: now + self.lease.as_millis() as u64,
            },
        )?;
        match txn.commit().await {
            Ok(_) => {
                self.term.store(new_term, Ordering::SeqCst);
                self.set_owner(true);
                Ok(true)
            }
            Err(e) if e.is_retryable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn renew(&self) -> FalconResult<()> {
        let term = self.term();
        let now = now_millis();
        let mut txn = MetaTxn::new(self.store.clone());
        let lease: Option<OwnerLease> = txn.get(&MetaKey::OwnerLease).await?;
        match lease {
            Some(l) if l.node_id == self.node_id && l.term == term && term != 0 => {
                if l.expires_at_ms <= now {
                    return Err(self.lose().into());
                }
            }
            _ => return Err(self.lose().into()),
        }
        txn.put(
            MetaKey::OwnerLease,
            &OwnerLease {
                node_id: self.node_id,
                term,
                expires_at_ms: now + self.lease.as_millis() as u64,
            },
        )?;
        match txn.commit().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable() => Err(self.lose().into()),
            Err(e) => Err(e),
        }
    }

    async fn resign(&self) -> FalconResult<()> {
        let term = self.term();
        if term == 0 {
            return Ok(());
        }
        let mut txn = MetaTxn::new(self.store.clone());
        let lease: Option<OwnerLease> = txn.get(&MetaKey::OwnerLease).await?;
        if let Some(l) = lease {
            if l.node_id == self.node_id && l.term == term {
                txn.delete(MetaKey::OwnerLease);
                txn.commit().await?;
            }
        }
        self.lose();
        Ok(())
    }

    fn is_owner(&self) -> bool {
        *self.owner.borrow()
    }

    fn watch_ownership(&self) -> watch::Receiver<bool> {
        self.owner.subscribe()
    }

    async fn fence(&self, txn: &mut MetaTxn) -> FalconResult<()> {
        let term = self.term();
        if term == 0 {
            return Err(ClusterError::NotOwner(self.node_id).into());
        }
        txn.check_owner(self.node_id, term).await
    }
}
