use crate::store::{now_ms, Store};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// The two operations the scheduler may fire. Provided at construction;
/// implementations are expected to spawn and return immediately so a tick
/// never blocks the ticker.
pub trait Trigger: Send + Sync + 'static {
    fn refresh_subscriptions(&self);
    fn run_verification(&self);
}

#[derive(Default)]
struct TimerState {
    running: bool,
    stop: Option<Arc<Notify>>,
    next_sub_update: Option<i64>,
    next_verification: Option<i64>,
    last_verification: Option<i64>,
}

/// Two independent periodic tickers: subscription refresh and verification.
///
/// `restart` must be called whenever settings change; it atomically stops
/// both timers and re-reads the intervals. Tickers never fire before the
/// first interval elapses. `stop` cancels future ticks only — an in-flight
/// verification cycle still completes and persists its result.
pub struct Scheduler {
    store: Arc<Store>,
    trigger: Arc<dyn Trigger>,
    state: Arc<Mutex<TimerState>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, trigger: Arc<dyn Trigger>) -> Self {
        Self {
            store,
            trigger,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    pub fn start(&self) {
        let settings = match self.store.get_settings() {
            Ok(s) => s,
            Err(e) => {
                warn!("scheduler: cannot read settings, not starting: {}", e);
                return;
            }
        };

        let sub_interval = settings.subscription_interval_min;
        let verify_interval = settings.verification_interval_min;

        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        if state.running {
            return;
        }
        if sub_interval == 0 && verify_interval == 0 {
            info!("scheduler: both intervals zero, nothing to schedule");
            return;
        }

        let stop = Arc::new(Notify::new());
        state.stop = Some(stop.clone());
        state.running = true;

        if sub_interval > 0 {
            let interval = Duration::from_secs(sub_interval * 60);
            state.next_sub_update = Some(now_ms() + interval.as_millis() as i64);
            let trigger = self.trigger.clone();
            let shared = self.state.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    if sleep_or_stop(interval, &stop).await {
                        return;
                    }
                    info!("scheduler: subscription refresh tick");
                    trigger.refresh_subscriptions();
                    let mut state = shared.lock().expect("scheduler mutex poisoned");
                    state.next_sub_update = Some(now_ms() + interval.as_millis() as i64);
                }
            });
            info!("scheduler: subscription ticker started, interval_min={}", sub_interval);
        }

        if verify_interval > 0 {
            let interval = Duration::from_secs(verify_interval * 60);
            state.next_verification = Some(now_ms() + interval.as_millis() as i64);
            let trigger = self.trigger.clone();
            let shared = self.state.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    if sleep_or_stop(interval, &stop).await {
                        return;
                    }
                    info!("scheduler: verification tick");
                    trigger.run_verification();
                    let mut state = shared.lock().expect("scheduler mutex poisoned");
                    let now = now_ms();
                    state.last_verification = Some(now);
                    state.next_verification = Some(now + interval.as_millis() as i64);
                }
            });
            info!("scheduler: verification ticker started, interval_min={}", verify_interval);
        }
    }

    /// Cancels future ticks. A verification cycle already in progress is not
    /// interrupted.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        if let Some(stop) = state.stop.take() {
            stop.notify_waiters();
        }
        state.running = false;
        state.next_sub_update = None;
        state.next_verification = None;
    }

    /// Atomically stop both timers and re-read intervals from settings.
    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("scheduler mutex poisoned").running
    }

    /// Next subscription-refresh fire time (unix ms), if scheduled.
    pub fn next_sub_update(&self) -> Option<i64> {
        self.state
            .lock()
            .expect("scheduler mutex poisoned")
            .next_sub_update
    }

    pub fn next_verification(&self) -> Option<i64> {
        self.state
            .lock()
            .expect("scheduler mutex poisoned")
            .next_verification
    }

    pub fn last_verification(&self) -> Option<i64> {
        self.state
            .lock()
            .expect("scheduler mutex poisoned")
            .last_verification
    }
}

/// Sleep for `duration`, but return `true` immediately if the stop signal
/// fires first.
async fn sleep_or_stop(duration: Duration, stop: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop.notified() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Settings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTrigger {
        refreshes: AtomicUsize,
        verifications: AtomicUsize,
    }

    impl Trigger for CountingTrigger {
        fn refresh_subscriptions(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
        fn run_verification(&self) {
            self.verifications.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store_with(sub_min: u64, verify_min: u64) -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .update_settings(Settings {
                subscription_interval_min: sub_min,
                verification_interval_min: verify_min,
                ..Settings::default()
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_zero_intervals_is_noop() {
        let scheduler = Scheduler::new(store_with(0, 0), Arc::new(CountingTrigger::default()));
        scheduler.start();
        assert!(!scheduler.is_running());
        assert!(scheduler.next_sub_update().is_none());
        assert!(scheduler.next_verification().is_none());
    }

    #[tokio::test]
    async fn test_start_schedules_future_fires() {
        let scheduler = Scheduler::new(store_with(10, 30), Arc::new(CountingTrigger::default()));
        scheduler.start();
        assert!(scheduler.is_running());

        let now = now_ms();
        let next_sub = scheduler.next_sub_update().unwrap();
        let next_verify = scheduler.next_verification().unwrap();
        // Never fires before the first interval elapses.
        assert!(next_sub >= now + 9 * 60 * 1000);
        assert!(next_verify >= now + 29 * 60 * 1000);

        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(scheduler.next_sub_update().is_none());
    }

    #[tokio::test]
    async fn test_restart_recomputes_from_new_settings() {
        let store = store_with(0, 30);
        let scheduler = Scheduler::new(store.clone(), Arc::new(CountingTrigger::default()));
        scheduler.start();
        let first = scheduler.next_verification().unwrap();
        assert!(scheduler.next_sub_update().is_none());

        // Interval shrinks from 30 to 5 minutes.
        store
            .update_settings(Settings {
                verification_interval_min: 5,
                ..Settings::default()
            })
            .unwrap();
        scheduler.restart();

        let next = scheduler.next_verification().unwrap();
        assert!(next <= now_ms() + 5 * 60 * 1000 + 1000);
        assert!(next < first);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_fires_and_reschedules() {
        let store = store_with(0, 1);
        let trigger = Arc::new(CountingTrigger::default());
        let scheduler = Scheduler::new(store, trigger.clone());
        scheduler.start();

        // Two intervals pass.
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(trigger.verifications.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.last_verification().is_some());
        scheduler.stop();
    }
}
