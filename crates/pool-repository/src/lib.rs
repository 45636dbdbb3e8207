//! # pool-repository
//!
//! Replica repository of a storage pool node.
//!
//! The repository owns every replica stored in the pool: its state machine,
//! its metadata record and its share of the space ledger. Callers create and
//! read replicas through handles; listeners and the eviction policy learn
//! about changes through events.
//!
//! ## Replica states
//!
//! ```text
//! NEW ─▶ FROM_CLIENT | FROM_STORE | FROM_POOL ─▶ PRECIOUS | CACHED
//!                       │ (abort)                      │   ▲
//!                       ▼                              ▼   │
//!                    BROKEN ◀──────────────────────▶ BROKEN
//!                                  │
//!                                  ▼
//!                   REMOVED ─▶ DESTROYED (last reader closed)
//! ```
//!
//! ## On-disk layout
//!
//! ```text
//! <base_dir>/
//! ├── setup.toml          # runtime size and gap
//! ├── meta/<ID>.json      # one record per replica
//! └── data/<ID>           # replica data
//! ```

pub mod account;
pub mod admin;
pub mod attributes;
pub mod error;
pub mod fault;
pub mod handle;
mod health;
pub mod id;
pub mod info;
pub mod namespace;
pub mod notify;
pub mod record;
pub mod repository;
mod scheduler;
pub mod state;
pub mod sticky;
pub mod store;
pub mod sweeper;

pub use account::{Account, CancellationToken, LedgerError, SpaceRecord};
pub use admin::{AdminCommand, RepCommand, RepSetCommand, SetCommand, StickyCommand, StickyMode};
pub use attributes::FileAttributes;
pub use error::{RepositoryError, Result};
pub use fault::{FaultAction, FaultEvent, FaultListener};
pub use handle::{OpenFlags, ReadHandle, ReplicaChannel, WriteHandle};
pub use id::{InvalidReplicaId, ReplicaId};
pub use info::RepositoryInfo;
pub use namespace::{Namespace, NamespaceError, NamespaceResult, NullNamespace};
pub use notify::{ListenerId, ReplicaEvent, StateListener};
pub use record::CacheEntry;
pub use repository::{Lifecycle, Repository};
pub use state::ReplicaState;
pub use sticky::StickyRecord;
pub use store::{FileMetadataStore, MetadataStore, PersistedRecord, StoreError, StoreResult};
pub use sweeper::{LruSweeper, SweeperPolicy};
