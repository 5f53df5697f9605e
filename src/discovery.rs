//! Finding assets and their submodels through retained `_meta` records.

use crate::definition::{MetaDescriptor, SubmodelDescriptor};
use crate::topic::{self, Topic, META_ELEMENT};
use crate::transport::InboundMessage;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Taps inbound traffic for discovery rounds in progress.
#[derive(Debug, Default)]
pub(crate) struct MetaWatchers {
    next_id: AtomicU64,
    watchers: DashMap<u64, (String, mpsc::UnboundedSender<InboundMessage>)>,
}

impl MetaWatchers {
    pub fn watch(self: &Arc<Self>, filter: &str) -> MetaWatch {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.insert(id, (filter.to_string(), tx));
        MetaWatch {
            id,
            rx,
            watchers: Arc::clone(self),
        }
    }

    pub fn offer(&self, message: &InboundMessage) {
        for entry in self.watchers.iter() {
            let (filter, tx) = entry.value();
            if topic::matches(filter, &message.topic) {
                let _ = tx.send(message.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}

/// One discovery round's view of the traffic; stops watching when dropped.
#[derive(Debug)]
pub(crate) struct MetaWatch {
    id: u64,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    watchers: Arc<MetaWatchers>,
}

impl MetaWatch {
    /// Collects messages until none arrived for `grace`, or `max_wait` passed.
    pub async fn collect_until_quiet(&mut self, grace: Duration, max_wait: Duration) -> Vec<InboundMessage> {
        let started = Instant::now();
        let mut collected = Vec::new();
        loop {
            let remaining = max_wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                log::debug!("Discovery hit its upper bound of {:?}", max_wait);
                break;
            }
            match tokio::time::timeout(grace.min(remaining), self.rx.recv()).await {
                Ok(Some(message)) => collected.push(message),
                Ok(None) | Err(_) => break,
            }
        }
        collected
    }
}

impl Drop for MetaWatch {
    fn drop(&mut self) {
        self.watchers.watchers.remove(&self.id);
    }
}

pub(crate) fn asset_meta_filter(namespace: &str, asset_name: &str) -> String {
    topic::build([namespace, asset_name, "+", META_ELEMENT])
}

pub(crate) fn namespace_meta_filter(namespace: Option<&str>) -> String {
    topic::build([namespace.unwrap_or("+"), "+", "+", META_ELEMENT])
}

/// Turns collected `_meta` messages into descriptors, one per submodel name,
/// the latest message winning. Cleared and malformed records are skipped.
pub(crate) fn descriptors_from_metas(messages: &[InboundMessage]) -> Vec<SubmodelDescriptor> {
    let mut by_name: BTreeMap<String, SubmodelDescriptor> = BTreeMap::new();
    for message in messages {
        let Ok(address) = Topic::parse(&message.topic) else {
            continue;
        };
        if message.payload.is_empty() {
            by_name.remove(&address.submodel);
            continue;
        }
        let meta: MetaDescriptor = match serde_json::from_slice(&message.payload) {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("Ignoring malformed _meta on {}: {}", message.topic, e);
                continue;
            }
        };
        match SubmodelDescriptor::from_value(meta.submodel_definition, meta.submodel_url) {
            Ok(descriptor) if descriptor.name() == address.submodel => {
                by_name.insert(address.submodel, descriptor);
            }
            Ok(descriptor) => log::warn!(
                "_meta on {} describes submodel '{}', ignored",
                message.topic,
                descriptor.name()
            ),
            Err(e) => log::warn!("Ignoring invalid descriptor in {}: {}", message.topic, e),
        }
    }
    by_name.into_values().collect()
}

/// Groups collected `_meta` messages into `namespace/asset -> submodel names`.
pub(crate) fn assets_from_metas(messages: &[InboundMessage]) -> BTreeMap<String, BTreeSet<String>> {
    let mut assets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for message in messages {
        let Ok(address) = Topic::parse(&message.topic) else {
            continue;
        };
        let entry = assets.entry(address.full_asset_name()).or_default();
        if message.payload.is_empty() {
            entry.remove(&address.submodel);
        } else {
            entry.insert(address.submodel);
        }
    }
    assets.retain(|_, submodels| !submodels.is_empty());
    assets
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(topic: &str, name: &str) -> InboundMessage {
        let payload = serde_json::to_vec(&json!({
            "source": "ns/ep",
            "submodel_url": "inline",
            "submodel_definition": {"name": name, "properties": {"x": {"type": "integer"}}}
        }))
        .unwrap();
        InboundMessage {
            topic: topic.to_string(),
            payload,
            retain: true,
        }
    }

    fn cleared(topic: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Vec::new(),
            retain: false,
        }
    }

    #[test]
    fn filters() {
        assert_eq!(asset_meta_filter("ns", "robot"), "ns/robot/+/_meta");
        assert_eq!(namespace_meta_filter(None), "+/+/+/_meta");
        assert_eq!(namespace_meta_filter(Some("ns")), "ns/+/+/_meta");
    }

    #[test]
    fn descriptors_skip_bad_and_cleared_records() {
        let messages = vec![
            meta("ns/robot/pose/_meta", "pose"),
            meta("ns/robot/drive/_meta", "drive"),
            meta("ns/robot/mismatch/_meta", "other"),
            InboundMessage {
                topic: "ns/robot/broken/_meta".into(),
                payload: b"{".to_vec(),
                retain: true,
            },
            meta("ns/robot/gone/_meta", "gone"),
            cleared("ns/robot/gone/_meta"),
        ];
        let names: Vec<String> = descriptors_from_metas(&messages)
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["drive", "pose"]);
    }

    #[test]
    fn assets_grouped_by_full_name() {
        let messages = vec![
            meta("ns/a/s1/_meta", "s1"),
            meta("ns/a/s2/_meta", "s2"),
            meta("other/b/s1/_meta", "s1"),
            cleared("ns/c/s1/_meta"),
        ];
        let assets = assets_from_metas(&messages);
        assert_eq!(assets.len(), 2);
        assert_eq!(assets["ns/a"].len(), 2);
        assert!(assets["other/b"].contains("s1"));
    }

    #[tokio::test]
    async fn watch_collects_until_quiet() {
        let watchers = Arc::new(MetaWatchers::default());
        let mut watch = watchers.watch("ns/robot/+/_meta");
        watchers.offer(&meta("ns/robot/pose/_meta", "pose"));
        watchers.offer(&meta("ns/other/pose/_meta", "pose"));
        let collected = watch
            .collect_until_quiet(Duration::from_millis(30), Duration::from_secs(5))
            .await;
        assert_eq!(collected.len(), 1);
        drop(watch);
        assert!(watchers.is_empty());
    }
}
