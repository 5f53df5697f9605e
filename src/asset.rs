use crate::dispatcher::UpdateQueue;
use crate::manager::ManagerShared;
use crate::submodel::SubModel;
use crate::{topic, Error};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Implements the asset: writes properties, answers operations, emits events.
    Owner,
    /// Mirrors a remote asset: reads properties, invokes operations, listens to events.
    Consumer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Owner => write!(f, "owner"),
            Mode::Consumer => write!(f, "consumer"),
        }
    }
}

pub(crate) struct AssetInner {
    pub id: u64,
    pub namespace: String,
    pub name: String,
    pub mode: Mode,
    pub submodels: HashMap<String, Arc<SubModel>>,
    pub released: AtomicBool,
    pub manager: Weak<ManagerShared>,
    pub updates: UpdateQueue,
}

impl AssetInner {
    pub fn full_name(&self) -> String {
        topic::build([self.namespace.as_str(), self.name.as_str()])
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.submodels
            .values()
            .flat_map(|sm| sm.subscriptions())
            .collect()
    }
}

/// A handle on one asset, either owned by this process or mirrored from the
/// broker. Clones share the handle.
#[derive(Clone)]
pub struct Asset {
    pub(crate) inner: Arc<AssetInner>,
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("name", &self.full_name())
            .field("mode", &self.inner.mode)
            .field("submodels", &self.submodel_names())
            .finish()
    }
}

impl Asset {
    pub(crate) fn from_inner(inner: Arc<AssetInner>) -> Self {
        Asset { inner }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn full_name(&self) -> String {
        self.inner.full_name()
    }

    pub fn get_topic(&self) -> String {
        self.inner.full_name()
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn get_submodel(&self, name: &str) -> Option<Arc<SubModel>> {
        self.inner.submodels.get(name).cloned()
    }

    pub fn submodel(&self, name: &str) -> Result<Arc<SubModel>, Error> {
        self.get_submodel(name).ok_or_else(|| Error::SubmodelNotFound {
            asset: self.full_name(),
            name: name.to_string(),
        })
    }

    pub fn submodels(&self) -> Vec<Arc<SubModel>> {
        self.inner.submodels.values().cloned().collect()
    }

    pub fn submodel_names(&self) -> BTreeSet<String> {
        self.inner.submodels.keys().cloned().collect()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Stops routing inbound traffic to this handle and drops the broker
    /// subscriptions no other handle needs. Idempotent.
    pub async fn release(&self) -> Result<(), Error> {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.inner.manager.upgrade() {
            Some(manager) => manager.release_handle(&self.inner).await,
            None => Ok(()),
        }
    }
}

/// Live handles per mode, keyed by `namespace/asset`. Several handles may
/// exist for one asset; all of them receive every matching message.
#[derive(Default)]
pub(crate) struct AssetRegistry {
    owners: DashMap<String, Vec<Arc<AssetInner>>>,
    consumers: DashMap<String, Vec<Arc<AssetInner>>>,
}

impl AssetRegistry {
    fn table(&self, mode: Mode) -> &DashMap<String, Vec<Arc<AssetInner>>> {
        match mode {
            Mode::Owner => &self.owners,
            Mode::Consumer => &self.consumers,
        }
    }

    pub fn register(&self, asset: Arc<AssetInner>) {
        self.table(asset.mode)
            .entry(asset.full_name())
            .or_default()
            .push(asset);
    }

    pub fn unregister(&self, asset: &AssetInner) -> bool {
        let table = self.table(asset.mode);
        let key = asset.full_name();
        let removed = match table.get_mut(&key) {
            Some(mut handles) => {
                let before = handles.len();
                handles.retain(|h| h.id != asset.id);
                before != handles.len()
            }
            None => false,
        };
        table.remove_if(&key, |_, handles| handles.is_empty());
        removed
    }

    /// Snapshot, so no map lock is held while messages are delivered.
    pub fn handles(&self, mode: Mode, full_name: &str) -> Vec<Arc<AssetInner>> {
        self.table(mode)
            .get(full_name)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    pub fn all(&self, mode: Mode) -> Vec<Arc<AssetInner>> {
        self.table(mode)
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }
}
