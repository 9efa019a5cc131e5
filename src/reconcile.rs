//! Keeps the queue store in line with the keeper's directives.
//!
//! Two generations of identifiers are tracked. `current` holds everything
//! seen since the present connection was established, `previous` everything
//! seen during the connection before it. A CREATE for an identifier already in
//! `previous` is a replay after reconnect and is not added again; at a SYNCED
//! barrier anything in `previous` that was not replayed is deleted.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{ApplyError, SyncError};
use crate::fields::FieldMask;
use crate::protocol::{
    Command, Decoder, Directive, Identifier, Kind, PolicyKind, PolicyRecord, ProtocolRevision,
    SuspendRecord, SUPPORTED_VERSION,
};
use crate::store::QueueStore;
use crate::warmup::{WarmupIndex, WarmupPredicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    AwaitingSync,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// A SYNCED barrier completed; `first` is set the first time only.
    Synced { first: bool },
}

pub struct Reconciler {
    decoder: Decoder,
    store: Arc<dyn QueueStore>,
    index: WarmupIndex,
    current: BTreeSet<Identifier>,
    previous: BTreeSet<Identifier>,
    state: SyncState,
    apply_errors: usize,
}

impl Reconciler {
    pub fn new(revision: ProtocolRevision, store: Arc<dyn QueueStore>, index: WarmupIndex) -> Self {
        Reconciler {
            decoder: Decoder::new(revision),
            store,
            index,
            current: BTreeSet::new(),
            previous: BTreeSet::new(),
            state: SyncState::AwaitingSync,
            apply_errors: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn current(&self) -> &BTreeSet<Identifier> {
        &self.current
    }

    pub fn previous(&self) -> &BTreeSet<Identifier> {
        &self.previous
    }

    /// Called once a new keeper connection is up.
    pub fn begin_cycle(&mut self) {
        self.apply_errors = 0;
    }

    /// Called when the keeper connection is gone. What this connection saw
    /// becomes the baseline for deduplicating the next one.
    pub fn end_cycle(&mut self) {
        self.previous = std::mem::take(&mut self.current);
        log::debug!(
            "Connection cycle ended with {} known directive(s)",
            self.previous.len()
        );
    }

    pub fn handle_frame(&mut self, frame: &str) -> Result<Step, SyncError> {
        let command = self.decoder.decode(frame);
        self.apply(command)
    }

    /// Applies one command. An `Err` means the worker must stop.
    pub fn apply(&mut self, command: Command) -> Result<Step, SyncError> {
        match command {
            Command::Version(version) => {
                if version != SUPPORTED_VERSION {
                    log::error!("Unsupported version of policyd: {version}");
                    return Err(SyncError::UnsupportedVersion(version));
                }
                log::debug!("Keeper speaks protocol version {version}");
            }
            Command::Create(Directive::Policy(policy)) => self.create_policy(policy),
            Command::Create(Directive::Suspend(suspend)) => self.create_suspend(suspend),
            Command::Create(Directive::Unsupported) => {
                self.fail(ApplyError::UnsupportedType { action: "create" })
            }
            Command::Update(Some(policy)) => {
                log::debug!("Updating policy {}", policy.id);
                if let Err(source) = self.store.update_policy(&policy.id, policy.settings) {
                    self.fail(ApplyError::Store {
                        action: "update",
                        kind: Kind::Policy,
                        id: policy.id,
                        source,
                    });
                }
            }
            Command::Update(None) => self.fail(ApplyError::UnsupportedType { action: "update" }),
            Command::Delete(Some(identifier)) => self.delete(identifier),
            Command::Delete(None) => self.fail(ApplyError::UnsupportedType { action: "delete" }),
            Command::Synced => return self.barrier(),
            Command::Ignored => {}
        }
        Ok(Step::Continue)
    }

    fn create_policy(&mut self, policy: PolicyRecord) {
        let identifier = policy.identifier();

        if policy.kind == PolicyKind::Warmup {
            let predicate = WarmupPredicate {
                owner: identifier.clone(),
                local_address: String::new(),
                fields: policy.fields,
                values: policy.match_values(),
            };
            self.register_warmup(predicate, policy.selector.local_ip.as_deref());
        }

        let result = if self.previous.contains(&identifier) {
            log::debug!("Refreshing replayed policy {}", policy.id);
            self.store
                .update_policy(&policy.id, policy.settings)
                .map_err(|source| ("update", source))
        } else {
            log::debug!("Creating policy {}", policy.id);
            self.store.add_policy(policy).map_err(|source| ("create", source))
        };

        if let Err((action, source)) = result {
            self.fail(ApplyError::Store {
                action,
                kind: Kind::Policy,
                id: identifier.id.clone(),
                source,
            });
        }
        self.current.insert(identifier);
    }

    fn create_suspend(&mut self, suspend: SuspendRecord) {
        let identifier = suspend.identifier();

        if suspend.warmup {
            let predicate = WarmupPredicate {
                owner: identifier.clone(),
                local_address: String::new(),
                fields: FieldMask::EMPTY,
                values: Vec::new(),
            };
            self.register_warmup(predicate, suspend.selector.local_ip.as_deref());
        }

        if self.previous.contains(&identifier) {
            log::debug!("Suspend {} already known, not re-adding", suspend.id);
        } else {
            log::debug!("Creating suspend {}", suspend.id);
            if let Err(source) = self.store.add_suspend(suspend) {
                self.fail(ApplyError::Store {
                    action: "create",
                    kind: Kind::Suspend,
                    id: identifier.id.clone(),
                    source,
                });
            }
        }
        self.current.insert(identifier);
    }

    fn register_warmup(&self, mut predicate: WarmupPredicate, local_ip: Option<&str>) {
        match self.decoder.revision().warmup_address(local_ip) {
            Some(address) => {
                predicate.local_address = address;
                self.index.upsert(predicate);
            }
            None => log::error!("{} of type WARMUP was missing localip", predicate.owner),
        }
    }

    fn delete(&mut self, identifier: Identifier) {
        log::debug!("Deleting {identifier}");
        self.current.remove(&identifier);
        // A deleted identifier is no longer a replay candidate or an orphan.
        self.previous.remove(&identifier);

        let result = match identifier.kind {
            Kind::Policy => self.store.delete_policy(&identifier.id),
            Kind::Suspend => self.store.delete_suspend(&identifier.id),
        };
        self.index.remove_by_identifier(&identifier);

        if let Err(source) = result {
            let kind = identifier.kind;
            let err = ApplyError::Store {
                action: "delete",
                kind,
                id: identifier.id,
                source,
            };
            // Suspend delete failures never count, even before the first barrier.
            if kind == Kind::Suspend {
                log::error!("{err}");
            } else {
                self.fail(err);
            }
        }
    }

    fn barrier(&mut self) -> Result<Step, SyncError> {
        let orphans: Vec<Identifier> = self.previous.difference(&self.current).cloned().collect();
        for orphan in orphans {
            log::info!("Removing {orphan} no longer known to the keeper");
            let result = match orphan.kind {
                Kind::Policy => self.store.delete_policy(&orphan.id),
                Kind::Suspend => self.store.delete_suspend(&orphan.id),
            };
            if let Err(e) = result {
                log::error!("Failed to delete {orphan}: {e}");
            }
            self.index.remove_by_identifier(&orphan);
            self.previous.remove(&orphan);
        }

        if self.state == SyncState::AwaitingSync && self.apply_errors > 0 {
            return Err(SyncError::ApplyFailed {
                count: self.apply_errors,
            });
        }

        let first = self.state == SyncState::AwaitingSync;
        if first {
            log::info!("Synchronized {} directive(s) from keeper", self.current.len());
        }
        self.state = SyncState::Synced;
        self.apply_errors = 0;
        Ok(Step::Synced { first })
    }

    /// Before the first barrier every failure is counted and fails the
    /// barrier; afterwards, or under the legacy dialect, it is only logged.
    fn fail(&mut self, err: ApplyError) {
        log::error!("{err}");
        if self.state == SyncState::AwaitingSync
            && self.decoder.revision().apply_errors_are_fatal()
        {
            self.apply_errors += 1;
        }
    }
}
