//! Debounced typing indicators.
//!
//! Every `typing_started` re-arms a per-(typist, partner) timer. When the
//! timer runs out without a fresh start, a single `is_typing: false` goes
//! to the conversation. Explicit stops and disconnects cancel the timer.

use duet_core::room::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::ServerEvent;
use crate::relay::Hub;

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    pending: HashMap<(String, String), Pending>,
}

#[derive(Clone)]
pub struct TypingTracker {
    timers: Arc<Mutex<Timers>>,
    hub: Hub,
    timeout: Duration,
}

fn typing_event(user_id: &str, partner_id: &str, is_typing: bool) -> ServerEvent {
    ServerEvent::Typing {
        user_id: user_id.to_string(),
        partner_id: partner_id.to_string(),
        is_typing,
    }
}

impl TypingTracker {
    pub fn new(hub: Hub, timeout: Duration) -> Self {
        Self {
            timers: Arc::new(Mutex::new(Timers::default())),
            hub,
            timeout,
        }
    }

    /// `user` is typing to `partner`. Broadcasts `true` and (re)arms the auto-stop.
    pub async fn started(&self, user: &str, partner: &str) {
        let room = RoomId::resolve(user, partner);
        let key = (user.to_string(), partner.to_string());

        let mut timers = self.timers.lock().await;
        timers.next_generation += 1;
        let generation = timers.next_generation;
        if let Some(old) = timers.pending.remove(&key) {
            old.task.abort();
        }

        self.hub.to_room(&room, typing_event(user, partner, true));

        let tracker = self.clone();
        let deadline = Instant::now() + self.timeout;
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            tracker.expire(task_key, generation).await;
        });
        timers.pending.insert(key, Pending { generation, task });
    }

    /// Explicit stop. Always broadcasts `false`, armed or not.
    pub async fn stopped(&self, user: &str, partner: &str) {
        let key = (user.to_string(), partner.to_string());
        if let Some(old) = self.timers.lock().await.pending.remove(&key) {
            old.task.abort();
        }
        self.hub
            .to_room(&RoomId::resolve(user, partner), typing_event(user, partner, false));
    }

    /// Drop every indicator `user` has up, e.g. on disconnect.
    pub async fn clear_sender(&self, user: &str) {
        let cleared: Vec<String> = {
            let mut timers = self.timers.lock().await;
            let keys: Vec<(String, String)> = timers
                .pending
                .keys()
                .filter(|(typist, _)| typist == user)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    let pending = timers.pending.remove(&key)?;
                    pending.task.abort();
                    Some(key.1)
                })
                .collect()
        };
        for partner in cleared {
            self.hub
                .to_room(&RoomId::resolve(user, &partner), typing_event(user, &partner, false));
        }
    }

    async fn expire(&self, key: (String, String), generation: u64) {
        let mut timers = self.timers.lock().await;
        // A newer start replaced this timer; its own expiry will fire.
        match timers.pending.get(&key) {
            Some(p) if p.generation == generation => {}
            _ => return,
        }
        timers.pending.remove(&key);
        drop(timers);

        let (user, partner) = key;
        debug!("Typing indicator for {user} -> {partner} timed out");
        self.hub
            .to_room(&RoomId::resolve(&user, &partner), typing_event(&user, &partner, false));
    }

    #[cfg(test)]
    async fn armed(&self) -> usize {
        self.timers.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::drain;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn typing_flags(events: &[crate::relay::Outbound]) -> Vec<bool> {
        events
            .iter()
            .filter_map(|o| match &o.event {
                ServerEvent::Typing { is_typing, .. } => Some(*is_typing),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        // Let spawned timer tasks observe the advanced clock.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_sends_single_stop() {
        let hub = Hub::new(64);
        let mut rx = hub.subscribe();
        let tracker = TypingTracker::new(hub, TIMEOUT);

        tracker.started("a", "b").await;
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        tracker.started("a", "b").await;
        assert_eq!(tracker.armed().await, 1);
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;

        // Re-armed at t=3, so nothing has expired at t=6.
        assert_eq!(typing_flags(&drain(&mut rx)), vec![true, true]);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(typing_flags(&drain(&mut rx)), vec![false]);
        assert_eq!(tracker.armed().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_timer() {
        let hub = Hub::new(64);
        let mut rx = hub.subscribe();
        let tracker = TypingTracker::new(hub, TIMEOUT);

        tracker.started("a", "b").await;
        tracker.started("a", "b").await;
        assert_eq!(tracker.armed().await, 1);
        tracker.stopped("a", "b").await;
        assert_eq!(tracker.armed().await, 0);
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(typing_flags(&drain(&mut rx)), vec![true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_start_still_broadcasts() {
        let hub = Hub::new(64);
        let mut rx = hub.subscribe();
        let tracker = TypingTracker::new(hub, TIMEOUT);

        tracker.stopped("a", "b").await;
        assert_eq!(typing_flags(&drain(&mut rx)), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_sender_only_touches_that_user() {
        let hub = Hub::new(64);
        let mut rx = hub.subscribe();
        let tracker = TypingTracker::new(hub, TIMEOUT);

        tracker.started("a", "b").await;
        tracker.started("a", "c").await;
        tracker.started("b", "a").await;
        drain(&mut rx);

        tracker.clear_sender("a").await;
        let out = drain(&mut rx);
        assert_eq!(typing_flags(&out), vec![false, false]);
        assert_eq!(tracker.armed().await, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        let late = drain(&mut rx);
        assert_eq!(late.len(), 1);
        assert!(matches!(&late[0].event, ServerEvent::Typing { user_id, .. } if user_id == "b"));
    }
}
