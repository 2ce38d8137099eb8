// Bounded per-container log history with live fanout.
//
// Lines arrive from the agent as `logs.line` broadcasts. Each container keeps
// the most recent lines in a ring; a viewer that joins gets the ring first and
// then every later line, with no gap or duplicate between the two.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use garrison_proto::{
    AgentEvent, LogLine,
    messages::{LOG_END, LOG_LINE},
};
use tokio::sync::broadcast;

use crate::hub::HubHandle;

#[derive(Debug)]
pub struct LogRing {
    capacity: usize,
    lines: VecDeque<LogLine>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: LogLine) {
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

struct Channel {
    ring: LogRing,
    // None once the agent ended the stream; recreated on the next line.
    live: Option<broadcast::Sender<LogLine>>,
    viewers: usize,
    // Bumped when the stream ends so viewers of the old stream are not counted.
    epoch: u64,
}

pub struct LogSubscription {
    /// Buffered history, oldest first.
    pub backlog: Vec<LogLine>,
    pub live: broadcast::Receiver<LogLine>,
    /// True when nobody was watching this container before.
    pub first_viewer: bool,
    /// Hand back to [`LogFanout::unsubscribe`].
    pub epoch: u64,
}

#[derive(Clone)]
pub struct LogFanout {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    epochs: Arc<AtomicU64>,
}

impl LogFanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Arc::new(Mutex::new(HashMap::new())),
            epochs: Arc::new(AtomicU64::new(0)),
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    fn channel<'a>(&self, map: &'a mut HashMap<String, Channel>, id: &str) -> &'a mut Channel {
        map.entry(id.to_string()).or_insert_with(|| Channel {
            ring: LogRing::new(self.capacity),
            live: None,
            viewers: 0,
            epoch: self.next_epoch(),
        })
    }

    fn sender(ch: &mut Channel, capacity: usize) -> &broadcast::Sender<LogLine> {
        ch.live
            .get_or_insert_with(|| broadcast::channel(capacity.max(16)).0)
    }

    pub fn append(&self, line: LogLine) {
        let mut map = self.channels();
        let ch = self.channel(&mut map, &line.container_id);
        ch.ring.push(line.clone());
        // no receivers is fine
        let _ = Self::sender(ch, self.capacity).send(line);
    }

    /// Upstream finished: live viewers see their stream close, and the next
    /// viewer has to ask the agent to stream again.
    pub fn end(&self, container_id: &str) {
        let epoch = self.next_epoch();
        if let Some(ch) = self.channels().get_mut(container_id) {
            ch.live = None;
            ch.viewers = 0;
            ch.epoch = epoch;
        }
    }

    /// Drop the container's history, and its entry when nobody is watching.
    pub fn reset(&self, container_id: &str) {
        let mut map = self.channels();
        let idle = match map.get_mut(container_id) {
            Some(ch) if ch.viewers > 0 => {
                ch.ring.clear();
                false
            }
            Some(_) => true,
            None => false,
        };
        if idle {
            map.remove(container_id);
        }
    }

    pub fn snapshot(&self, container_id: &str) -> Vec<LogLine> {
        self.channels()
            .get(container_id)
            .map(|ch| ch.ring.snapshot())
            .unwrap_or_default()
    }

    pub fn subscribe(&self, container_id: &str) -> LogSubscription {
        let mut map = self.channels();
        let ch = self.channel(&mut map, container_id);
        let first_viewer = ch.viewers == 0 || ch.live.is_none();
        ch.viewers += 1;
        let live = Self::sender(ch, self.capacity).subscribe();
        LogSubscription {
            backlog: ch.ring.snapshot(),
            live,
            first_viewer,
            epoch: ch.epoch,
        }
    }

    /// Returns true when the last viewer of the container's current stream
    /// left. Viewers of a stream that already ended never count.
    pub fn unsubscribe(&self, container_id: &str, epoch: u64) -> bool {
        let mut map = self.channels();
        let Some(ch) = map.get_mut(container_id).filter(|ch| ch.epoch == epoch) else {
            return false;
        };
        ch.viewers = ch.viewers.saturating_sub(1);
        ch.viewers == 0
    }

    fn on_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::LogLine(line) => self.append(line),
            AgentEvent::LogEnd(end) => self.end(&end.container_id),
            AgentEvent::Heartbeat(_) => {}
        }
    }

    /// Pump this agent's log broadcasts into the fanout.
    pub async fn feed_from(&self, hub: &HubHandle) {
        let mut events = hub.subscribe_all(&[LOG_LINE, LOG_END]).await;
        let fanout = self.clone();
        let agent = hub.agent().to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                fanout.on_event(event);
            }
            tracing::debug!(%agent, "log feed stopped");
        });
    }
}
