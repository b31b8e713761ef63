use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::rendezvous::tunnel::client::ClientState;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    Ping,
    Reconnect,
}

/// Watches a tunnel client's state: pings while it is `Running` and, with
/// auto-reconnect on, asks for a reconnect while it sits in `Disconnected`.
///
/// Timers only run in their state; any state change cancels them.
#[derive(Debug, Clone)]
pub struct KeepaliveSupervisor {
    ping_interval: Duration,
    reconnect_interval: Duration,
    auto_reconnect: bool,
}

impl KeepaliveSupervisor {
    pub fn new(ping_interval: Duration, reconnect_interval: Duration, auto_reconnect: bool) -> Self {
        Self {
            ping_interval: nonzero(ping_interval, DEFAULT_PING_INTERVAL),
            reconnect_interval: nonzero(reconnect_interval, DEFAULT_RECONNECT_INTERVAL),
            auto_reconnect,
        }
    }

    /// Runs until the state channel or the action channel goes away.
    pub async fn run<T>(self, mut state: watch::Receiver<ClientState>, actions: mpsc::WeakUnboundedSender<T>)
    where
        T: From<KeepaliveAction> + Send + 'static,
    {
        loop {
            let current = *state.borrow_and_update();
            let alive = match current {
                ClientState::Running => self.every(&mut state, &actions, self.ping_interval, KeepaliveAction::Ping).await,
                ClientState::Disconnected if self.auto_reconnect => {
                    self.every(&mut state, &actions, self.reconnect_interval, KeepaliveAction::Reconnect).await
                }
                _ => state.changed().await.is_ok(),
            };
            if !alive {
                return;
            }
        }
    }

    /// Emits `action` every `period` until the state changes. Returns `false`
    /// when either channel is closed.
    async fn every<T>(
        &self,
        state: &mut watch::Receiver<ClientState>,
        actions: &mpsc::WeakUnboundedSender<T>,
        period: Duration,
        action: KeepaliveAction,
    ) -> bool
    where
        T: From<KeepaliveAction>,
    {
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = state.changed() => return changed.is_ok(),
                _ = tick.tick() => {
                    let Some(tx) = actions.upgrade() else {
                        return false;
                    };
                    tracing::trace!(?action, "tunnel client: keepalive");
                    if tx.send(T::from(action)).is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

fn nonzero(d: Duration, fallback: Duration) -> Duration {
    if d.is_zero() { fallback } else { d }
}
