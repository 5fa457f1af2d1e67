/*!
 * Flashing concurrency gate.
 *
 * A fleet-wide counting limiter for re-imaging, independent of allocation.
 * The limit can change at any time; permits already handed out stay valid
 * and the new limit applies to later `take` calls only. Without an explicit
 * limit the host options are asked once, on first use.
 */
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Host-wide settings consulted by the flashing gate
pub trait HostOptions: Send + Sync + Debug {
    /// Maximum number of concurrent flashers, `None` for no limit
    fn concurrent_flasher_limit(&self) -> Option<usize>;
}

/// Host options with a fixed flasher limit
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticHostOptions {
    limit: Option<usize>,
}

impl StaticHostOptions {
    /// Create host options with the given limit
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit }
    }
}

impl HostOptions for StaticHostOptions {
    fn concurrent_flasher_limit(&self) -> Option<usize> {
        self.limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitLimit {
    Unresolved,
    Unlimited,
    Limited(usize),
}

#[derive(Debug)]
struct GateState {
    limit: PermitLimit,
    in_use: usize,
    waiting: usize,
}

/// Bounded limiter for concurrent flashing
#[derive(Debug)]
pub struct FlashingGate {
    state: Mutex<GateState>,
    released: Notify,
    host_options: Option<Arc<dyn HostOptions>>,
}

/// Decrements the waiter count when a blocked `take` ends or is dropped
struct Waiting<'a>(&'a Mutex<GateState>);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

impl FlashingGate {
    /// Create a gate
    ///
    /// An explicit `limit` wins; otherwise `host_options` decides on first
    /// use, and without host options the gate is unbounded.
    pub fn new(limit: Option<usize>, host_options: Option<Arc<dyn HostOptions>>) -> Self {
        let limit = match limit {
            Some(n) => PermitLimit::Limited(n),
            None => PermitLimit::Unresolved,
        };
        Self {
            state: Mutex::new(GateState {
                limit,
                in_use: 0,
                waiting: 0,
            }),
            released: Notify::new(),
            host_options,
        }
    }

    /// A gate without any limit
    pub fn unlimited() -> Self {
        let gate = Self::new(None, None);
        gate.state.lock().limit = PermitLimit::Unlimited;
        gate
    }

    fn resolve(&self, state: &mut GateState) -> PermitLimit {
        if state.limit == PermitLimit::Unresolved {
            state.limit = match self
                .host_options
                .as_ref()
                .and_then(|options| options.concurrent_flasher_limit())
            {
                Some(n) => PermitLimit::Limited(n),
                None => PermitLimit::Unlimited,
            };
            debug!("Flashing permit limit resolved to {:?}", state.limit);
        }
        state.limit
    }

    fn try_acquire(&self, state: &mut GateState) -> bool {
        let free = match self.resolve(state) {
            PermitLimit::Limited(n) => state.in_use < n,
            _ => true,
        };
        if free {
            state.in_use += 1;
        }
        free
    }

    /// Take a permit without waiting
    pub fn try_take(&self) -> bool {
        let mut state = self.state.lock();
        self.try_acquire(&mut state)
    }

    /// Take a permit, waiting for one to be returned if none is free
    pub async fn take(&self) {
        let mut waiting = None;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = self.state.lock();
                if self.try_acquire(&mut state) {
                    debug!("Flashing permit taken ({} in use)", state.in_use);
                    drop(state);
                    drop(waiting);
                    return;
                }
                if waiting.is_none() {
                    state.waiting += 1;
                    info!("Waiting for a flashing permit ({} queued)", state.waiting);
                }
            }
            if waiting.is_none() {
                waiting = Some(Waiting(&self.state));
            }

            released.await;
        }
    }

    /// Return a permit and wake one waiter
    pub fn return_permit(&self) {
        {
            let mut state = self.state.lock();
            if state.in_use == 0 {
                warn!("Flashing permit returned while none was taken");
                return;
            }
            state.in_use -= 1;
            debug!("Flashing permit returned ({} in use)", state.in_use);
        }
        self.released.notify_one();
    }

    /// Change the limit, `None` for unbounded
    ///
    /// Permits already taken stay valid even above the new limit.
    pub fn set_limit(&self, limit: Option<usize>) {
        {
            let mut state = self.state.lock();
            state.limit = match limit {
                Some(n) => PermitLimit::Limited(n),
                None => PermitLimit::Unlimited,
            };
            info!("Flashing permit limit set to {:?} ({} in use)", limit, state.in_use);
        }
        self.released.notify_waiters();
    }

    /// The effective limit, `None` when unbounded
    pub fn permit_limit(&self) -> Option<usize> {
        let mut state = self.state.lock();
        match self.resolve(&mut state) {
            PermitLimit::Limited(n) => Some(n),
            _ => None,
        }
    }

    /// Free permits, `None` when unbounded
    pub fn available_permits(&self) -> Option<usize> {
        let mut state = self.state.lock();
        match self.resolve(&mut state) {
            PermitLimit::Limited(n) => Some(n.saturating_sub(state.in_use)),
            _ => None,
        }
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Callers blocked in `take`
    pub fn queued(&self) -> usize {
        self.state.lock().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_limit_one_blocks_second_taker() {
        let gate = Arc::new(FlashingGate::new(Some(1), None));
        gate.take().await;
        assert_eq!(gate.available_permits(), Some(0));

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.queued(), 1);

        gate.return_permit();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gate.in_use(), 1);
        assert_eq!(gate.queued(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_never_blocks() {
        let gate = FlashingGate::unlimited();
        for _ in 0..50 {
            gate.take().await;
        }
        assert_eq!(gate.available_permits(), None);
        assert_eq!(gate.in_use(), 50);
    }

    #[test]
    fn test_host_options_consulted_lazily() {
        let gate = FlashingGate::new(None, Some(Arc::new(StaticHostOptions::new(Some(2)))));
        assert_eq!(gate.permit_limit(), Some(2));
        assert!(gate.try_take());
        assert!(gate.try_take());
        assert!(!gate.try_take());

        let gate = FlashingGate::new(Some(3), Some(Arc::new(StaticHostOptions::new(Some(2)))));
        assert_eq!(gate.permit_limit(), Some(3));

        let gate = FlashingGate::new(None, Some(Arc::new(StaticHostOptions::default())));
        assert_eq!(gate.permit_limit(), None);
    }

    #[tokio::test]
    async fn test_set_limit_keeps_held_permits() {
        let gate = Arc::new(FlashingGate::new(Some(2), None));
        gate.take().await;
        gate.take().await;

        gate.set_limit(Some(1));
        assert_eq!(gate.in_use(), 2);
        assert_eq!(gate.available_permits(), Some(0));

        // one return is not enough to get under the new limit
        gate.return_permit();
        assert!(!gate.try_take());
        gate.return_permit();
        assert!(gate.try_take());
    }

    #[tokio::test]
    async fn test_raising_limit_wakes_waiters() {
        let gate = Arc::new(FlashingGate::new(Some(1), None));
        gate.take().await;

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.take().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.queued(), 2);

        gate.set_limit(None);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(100), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(gate.in_use(), 3);
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_queue() {
        let gate = FlashingGate::new(Some(0), None);
        assert!(tokio::time::timeout(Duration::from_millis(20), gate.take()).await.is_err());
        assert_eq!(gate.queued(), 0);
    }

    #[test]
    fn test_spurious_return_is_ignored() {
        let gate = FlashingGate::new(Some(1), None);
        gate.return_permit();
        assert_eq!(gate.available_permits(), Some(1));
    }
}
