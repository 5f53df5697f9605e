use crate::transport::Transport;
use crate::Error;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex as TokioMutex;

/// Broker subscriptions shared by all handles, reference counted per filter.
///
/// Every acquire subscribes again even if the filter is already active, since
/// that is what makes the broker replay retained values for a new handle.
/// Unsubscribing only happens when the last user releases the filter.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    counts: TokioMutex<HashMap<String, usize>>,
}

impl SubscriptionTable {
    pub async fn acquire(&self, transport: &dyn Transport, filters: &BTreeSet<String>) -> Result<(), Error> {
        let mut counts = self.counts.lock().await;
        let mut acquired: Vec<&String> = Vec::new();
        for filter in filters {
            if let Err(e) = transport.subscribe(filter).await {
                for done in acquired {
                    Self::decrement(&mut counts, transport, done).await;
                }
                return Err(e);
            }
            *counts.entry(filter.clone()).or_insert(0) += 1;
            acquired.push(filter);
        }
        Ok(())
    }

    pub async fn release(&self, transport: &dyn Transport, filters: &BTreeSet<String>) {
        let mut counts = self.counts.lock().await;
        for filter in filters {
            Self::decrement(&mut counts, transport, filter).await;
        }
    }

    async fn decrement(counts: &mut HashMap<String, usize>, transport: &dyn Transport, filter: &str) {
        let Some(count) = counts.get_mut(filter) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(filter);
            if let Err(e) = transport.unsubscribe(filter).await {
                log::warn!("Unsubscribe from {} failed: {}", filter, e);
            }
        }
    }

    /// Re-issues every active filter, e.g. after a new session was opened.
    pub async fn resubscribe_all(&self, transport: &dyn Transport) -> Result<(), Error> {
        let counts = self.counts.lock().await;
        for filter in counts.keys() {
            transport.subscribe(filter).await?;
        }
        Ok(())
    }

    pub async fn active(&self) -> BTreeSet<String> {
        self.counts.lock().await.keys().cloned().collect()
    }
}
