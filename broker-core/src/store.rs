//! Store coordinator (C7).
//!
//! Per endpoint, tracks the small key/value stores this endpoint hosts,
//! either as an authoritative `master` or a mirrored `clone` (§4.7). Store
//! commands travel as ordinary pub/sub traffic on the store id's topic; the
//! coordinator itself never touches the network — `EndpointCore` (C4) is
//! responsible for actually publishing the `StoreEvent`s this module
//! produces and for routing incoming `StoreCommand`s back in here.
//!
//! Naming here (`master`/`clone`, `attach_master`/`attach_clone`) follows
//! the replication vocabulary of the system this design is descended from.

use crate::data::Data;
use crate::error::BrokerError;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A store's name, scoped to one endpoint's `StoreCoordinator`.
pub type StoreId = String;

/// Whether a local replica is authoritative or mirrors a remote master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Master,
    Clone,
}

/// A mutating operation applied to a store's key/value map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreCommand {
    /// Insert only if the key is absent; fails silently (no-op) otherwise,
    /// matching `kind = add` on the events topic.
    Insert { key: Data, value: Data, expiry: Option<Duration> },
    /// Insert or overwrite unconditionally (`kind = put`).
    Put { key: Data, value: Data, expiry: Option<Duration> },
    /// Remove a key if present (`kind = erase`).
    Erase { key: Data },
}

/// An event emitted by the master after applying a `StoreCommand`, carried
/// on the store's derived events topic and replayed verbatim by clones
/// (§6, "Store event encoding").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Add { key: Data, value: Data, expiry: Option<Duration> },
    Put { key: Data, value: Data, expiry: Option<Duration> },
    Erase { key: Data },
}

/// One store replica's state (§3, Store record).
pub struct StoreReplica {
    pub id: StoreId,
    pub role: StoreRole,
    kv: BTreeMap<Data, Data>,
    expiries: HashMap<Data, Duration>,
}

impl StoreReplica {
    fn new(id: StoreId, role: StoreRole) -> Self {
        Self {
            id,
            role,
            kv: BTreeMap::new(),
            expiries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &Data) -> Option<&Data> {
        self.kv.get(key)
    }

    #[must_use]
    pub fn kv(&self) -> &BTreeMap<Data, Data> {
        &self.kv
    }

    #[must_use]
    pub fn expiry_of(&self, key: &Data) -> Option<Duration> {
        self.expiries.get(key).copied()
    }

    /// Applies `cmd` to this replica's map, assuming `self` is a master
    /// (called only from `StoreCoordinator::apply_master_command`), and
    /// returns the event to broadcast, or `None` if the command was a
    /// conditional insert that lost (key already present).
    fn apply_as_master(&mut self, cmd: StoreCommand) -> Option<StoreEvent> {
        match cmd {
            StoreCommand::Insert { key, value, expiry } => {
                if self.kv.contains_key(&key) {
                    return None;
                }
                self.kv.insert(key.clone(), value.clone());
                if let Some(d) = expiry {
                    self.expiries.insert(key.clone(), d);
                }
                Some(StoreEvent::Add { key, value, expiry })
            }
            StoreCommand::Put { key, value, expiry } => {
                self.kv.insert(key.clone(), value.clone());
                if let Some(d) = expiry {
                    self.expiries.insert(key.clone(), d);
                } else {
                    self.expiries.remove(&key);
                }
                Some(StoreEvent::Put { key, value, expiry })
            }
            StoreCommand::Erase { key } => {
                self.kv.remove(&key);
                self.expiries.remove(&key);
                Some(StoreEvent::Erase { key })
            }
        }
    }

    /// Applies an event replayed from a master (called on clones).
    fn apply_event(&mut self, event: &StoreEvent) {
        match event {
            StoreEvent::Add { key, value, expiry } => {
                if !self.kv.contains_key(key) {
                    self.kv.insert(key.clone(), value.clone());
                    if let Some(d) = expiry {
                        self.expiries.insert(key.clone(), *d);
                    }
                }
            }
            StoreEvent::Put { key, value, expiry } => {
                self.kv.insert(key.clone(), value.clone());
                if let Some(d) = expiry {
                    self.expiries.insert(key.clone(), *d);
                } else {
                    self.expiries.remove(key);
                }
            }
            StoreEvent::Erase { key } => {
                self.kv.remove(key);
                self.expiries.remove(key);
            }
        }
    }
}

/// What the caller (C4) should do after `StoreCoordinator::resolve_command`
/// decides where a command belongs.
pub enum CommandRoute {
    /// This endpoint hosts the master locally; apply it and broadcast the
    /// returned event on the derived events topic.
    ApplyLocally(StoreEvent),
    /// The command was applied locally but had no effect (a conditional
    /// insert that lost to an existing key); nothing to broadcast.
    NoOp,
    /// This endpoint only has a clone (or nothing); forward the command
    /// on the store id's topic so routing carries it toward the master.
    ForwardToMaster,
}

/// Per-endpoint table of store replicas, one entry per store id this
/// endpoint participates in (§4.7).
#[derive(Default)]
pub struct StoreCoordinator {
    stores: HashMap<StoreId, StoreReplica>,
}

impl StoreCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an authoritative replica for `id`. The caller is
    /// responsible for advertising `id` as a topic so C3 can route
    /// commands to it from anywhere in the overlay (§4.7).
    ///
    /// # Errors
    /// Returns `BrokerError::StoreIdInUse` if `id` is already known
    /// locally as a master.
    pub fn attach_master(&mut self, id: StoreId) -> Result<(), BrokerError> {
        if let Some(existing) = self.stores.get(&id) {
            if existing.role == StoreRole::Master {
                return Err(BrokerError::StoreIdInUse(id));
            }
        }
        self.stores.insert(id.clone(), StoreReplica::new(id, StoreRole::Master));
        Ok(())
    }

    /// Creates a local mirrored replica for `id`. The caller is
    /// responsible for subscribing to the id's command/events topics.
    pub fn attach_clone(&mut self, id: StoreId) {
        self.stores
            .entry(id.clone())
            .or_insert_with(|| StoreReplica::new(id, StoreRole::Clone));
    }

    /// Drops a locally-hosted replica (owner went away).
    pub fn detach(&mut self, id: &str) -> Option<StoreReplica> {
        self.stores.remove(id)
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<&StoreReplica> {
        self.stores.get(id)
    }

    #[must_use]
    pub fn find_mut(&mut self, id: &str) -> Option<&mut StoreReplica> {
        self.stores.get_mut(id)
    }

    /// Returns `true` if this endpoint locally hosts `id`'s master.
    #[must_use]
    pub fn is_local_master(&self, id: &str) -> bool {
        matches!(self.stores.get(id), Some(r) if r.role == StoreRole::Master)
    }

    /// Decides what to do with a command for `id`: apply it here if this
    /// endpoint hosts the master, otherwise signal the caller to forward
    /// it toward the master via C3 routing (§4.7, `find_master`).
    ///
    /// # Errors
    /// Returns `BrokerError::NoSuchMaster` if this endpoint has neither a
    /// local master nor any known replica for `id` at all (the caller
    /// still attempts remote routing first when it has a clone, since a
    /// clone implies *some* master exists in the overlay).
    pub fn resolve_command(&mut self, id: &str, cmd: StoreCommand) -> Result<CommandRoute, BrokerError> {
        match self.stores.get_mut(id) {
            Some(replica) if replica.role == StoreRole::Master => Ok(replica
                .apply_as_master(cmd)
                .map_or(CommandRoute::NoOp, CommandRoute::ApplyLocally)),
            Some(_clone_replica) => Ok(CommandRoute::ForwardToMaster),
            None => Err(BrokerError::NoSuchMaster(id.to_string())),
        }
    }

    /// Applies a replayed event to a local clone (no-op if `id` is not a
    /// known clone here).
    pub fn apply_event(&mut self, id: &str, event: &StoreEvent) {
        if let Some(replica) = self.stores.get_mut(id) {
            if replica.role == StoreRole::Clone {
                replica.apply_event(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_attach_master_is_store_id_in_use() {
        let mut sc = StoreCoordinator::new();
        sc.attach_master("kv".into()).unwrap();
        assert_eq!(
            sc.attach_master("kv".into()),
            Err(BrokerError::StoreIdInUse("kv".into()))
        );
    }

    #[test]
    fn master_applies_put_and_emits_event() {
        let mut sc = StoreCoordinator::new();
        sc.attach_master("kv".into()).unwrap();
        let route = sc
            .resolve_command(
                "kv",
                StoreCommand::Put {
                    key: Data::string("k"),
                    value: Data::integer(1),
                    expiry: None,
                },
            )
            .unwrap();
        match route {
            CommandRoute::ApplyLocally(StoreEvent::Put { key, value, .. }) => {
                assert_eq!(key, Data::string("k"));
                assert_eq!(value, Data::integer(1));
            }
            _ => panic!("expected ApplyLocally(Put)"),
        }
        assert_eq!(sc.find("kv").unwrap().get(&Data::string("k")), Some(&Data::integer(1)));
    }

    #[test]
    fn clone_command_is_forwarded_to_master() {
        let mut sc = StoreCoordinator::new();
        sc.attach_clone("kv".into());
        let route = sc
            .resolve_command(
                "kv",
                StoreCommand::Put {
                    key: Data::string("k"),
                    value: Data::integer(1),
                    expiry: None,
                },
            )
            .unwrap();
        assert!(matches!(route, CommandRoute::ForwardToMaster));
        assert!(sc.find("kv").unwrap().get(&Data::string("k")).is_none());
    }

    #[test]
    fn clone_applies_replayed_event_and_matches_master() {
        let mut master = StoreCoordinator::new();
        master.attach_master("kv".into()).unwrap();
        let route = master
            .resolve_command(
                "kv",
                StoreCommand::Put {
                    key: Data::string("k"),
                    value: Data::integer(1),
                    expiry: None,
                },
            )
            .unwrap();
        let CommandRoute::ApplyLocally(event) = route else {
            panic!("expected local apply");
        };

        let mut clone = StoreCoordinator::new();
        clone.attach_clone("kv".into());
        clone.apply_event("kv", &event);

        assert_eq!(
            clone.find("kv").unwrap().kv(),
            master.find("kv").unwrap().kv()
        );
    }

    #[test]
    fn unknown_store_is_no_such_master() {
        let mut sc = StoreCoordinator::new();
        let err = sc
            .resolve_command("kv", StoreCommand::Erase { key: Data::string("k") })
            .unwrap_err();
        assert_eq!(err, BrokerError::NoSuchMaster("kv".into()));
    }

    #[test]
    fn conditional_insert_loses_to_existing_key() {
        let mut sc = StoreCoordinator::new();
        sc.attach_master("kv".into()).unwrap();
        sc.resolve_command(
            "kv",
            StoreCommand::Insert {
                key: Data::string("k"),
                value: Data::integer(1),
                expiry: None,
            },
        )
        .unwrap();
        let route = sc
            .resolve_command(
                "kv",
                StoreCommand::Insert {
                    key: Data::string("k"),
                    value: Data::integer(2),
                    expiry: None,
                },
            )
            .unwrap();
        assert!(matches!(route, CommandRoute::NoOp));
        assert_eq!(sc.find("kv").unwrap().get(&Data::string("k")), Some(&Data::integer(1)));
    }
}
