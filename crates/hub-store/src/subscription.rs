//! Pattern subscriptions over the log
//!
//! A subscription catches up from the log, then follows the live fan-out
//! channel. Events arrive in sequence order with no duplicates; a gap in
//! the live feed (lag or a missed notification) is filled by re-reading the
//! log.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use regex::RegexSet;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hub_common::Event;

use crate::checkpoint::CheckpointStore;
use crate::store::EventStore;
use crate::{Result, StoreError};

const CATCH_UP_CHUNK: u64 = 512;
const CHANNEL_CAPACITY: usize = 256;

/// Compiled event type patterns.
///
/// `*` matches within one dot-separated segment, `**` matches anything,
/// every other character is literal.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<String>,
    set: RegexSet,
}

impl PatternSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let regexes: Vec<String> = patterns.iter().map(|p| glob_to_regex(p.as_ref())).collect();
        Ok(Self {
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
            set: RegexSet::new(regexes)?,
        })
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.set.is_match(event_type)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("**") {
            out.push_str(".*");
            rest = r;
        } else if let Some(r) = rest.strip_prefix('*') {
            out.push_str("[^.]*");
            rest = r;
        } else {
            let next = rest.find('*').unwrap_or(rest.len());
            out.push_str(&regex::escape(&rest[..next]));
            rest = &rest[next..];
        }
    }
    out.push('$');
    out
}

/// What a subscriber asks for
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub service: String,
    pub patterns: Vec<String>,
    /// Resume after the last acknowledged sequence instead of the current head
    pub durable: bool,
}

impl SubscriptionSpec {
    pub fn new(service: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            service: service.into(),
            patterns,
            durable: false,
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn checkpoint_key(&self) -> String {
        format!("subscription:{}", self.service)
    }
}

/// Stream of matching events. Dropping it stops the feeding task.
pub struct EventSubscription {
    spec: SubscriptionSpec,
    rx: mpsc::Receiver<Result<Event>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    last_acked: u64,
    task: JoinHandle<()>,
}

impl EventSubscription {
    pub(crate) async fn start(
        store: EventStore,
        spec: SubscriptionSpec,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
    ) -> Result<Self> {
        let patterns = PatternSet::new(&spec.patterns)?;
        // Subscribe before reading the head so nothing falls between the two
        let live = store.live();

        let start_after = match (&checkpoints, spec.durable) {
            (Some(checkpoints), true) => match checkpoints.get_checkpoint(&spec.checkpoint_key()).await? {
                Some(seq) => seq,
                None => store.first_available().saturating_sub(1),
            },
            _ => store.head(),
        };

        debug!(
            service = %spec.service,
            patterns = ?spec.patterns,
            durable = spec.durable,
            start_after = start_after,
            "Starting subscription"
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(feed(store, patterns, start_after, live, tx));

        let checkpoints = if spec.durable { checkpoints } else { None };
        Ok(Self {
            spec,
            rx,
            checkpoints,
            last_acked: start_after,
            task,
        })
    }

    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    /// Record progress for a durable subscription. Acknowledging an older
    /// sequence than the last one is a no-op.
    pub async fn ack(&mut self, sequence: u64) -> Result<()> {
        if sequence <= self.last_acked {
            return Ok(());
        }
        self.last_acked = sequence;
        if let Some(checkpoints) = &self.checkpoints {
            checkpoints.save_checkpoint(&self.spec.checkpoint_key(), sequence).await?;
        }
        Ok(())
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }
}

impl Stream for EventSubscription {
    type Item = Result<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn feed(
    store: EventStore,
    patterns: PatternSet,
    start_after: u64,
    mut live: broadcast::Receiver<Arc<Event>>,
    tx: mpsc::Sender<Result<Event>>,
) {
    let mut last = start_after;

    let head = store.head();
    match catch_up(&store, &patterns, last, head, &tx).await {
        Ok(Some(pos)) => last = pos,
        Ok(None) => return,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            return;
        }
    }

    loop {
        let target = match live.recv().await {
            Ok(event) => {
                if event.sequence_number <= last {
                    continue;
                }
                if event.sequence_number == last + 1 {
                    if patterns.matches(&event.event_type)
                        && tx.send(Ok(event.as_ref().clone())).await.is_err()
                    {
                        return;
                    }
                    last = event.sequence_number;
                    continue;
                }
                event.sequence_number
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Subscription lagged, re-reading from log");
                store.head()
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match catch_up(&store, &patterns, last, target, &tx).await {
            Ok(Some(pos)) => last = pos,
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

/// Deliver matching events in `(after, until]` from the log. Returns the new
/// position, or `None` when the receiver is gone.
async fn catch_up(
    store: &EventStore,
    patterns: &PatternSet,
    after: u64,
    until: u64,
    tx: &mpsc::Sender<Result<Event>>,
) -> Result<Option<u64>> {
    let mut last = after;
    while last < until {
        let from = last + 1;
        let to = until.min(last + CATCH_UP_CHUNK);
        let reader = store.clone();
        let events = tokio::task::spawn_blocking(move || reader.read_range(from, to))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        if events.is_empty() {
            break;
        }
        for event in events {
            last = event.sequence_number;
            if patterns.matches(&event.event_type) && tx.send(Ok(event)).await.is_err() {
                return Ok(None);
            }
        }
    }
    Ok(Some(last))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_patterns() {
        let set = PatternSet::new(&["character.*", "image.**", "campaign.session.ended"]).unwrap();
        assert!(set.matches("character.created"));
        assert!(!set.matches("character.sheet.updated"));
        assert!(set.matches("image.render.dead_lettered"));
        assert!(set.matches("campaign.session.ended"));
        assert!(!set.matches("campaign.session.started"));
        assert!(!set.matches("characterXcreated"));
    }
}
