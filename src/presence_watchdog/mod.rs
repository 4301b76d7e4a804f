//! PresenceWatchdog - Shared Idle Countdown
//!
//! ## Responsibilities
//!
//! - Single fixed-cadence tick for all Auto-recording sessions
//! - Derive timeRemaining / timeoutPercent from the last presence signal
//! - Tell a session once its countdown has sat at zero for more than one tick
//!
//! The watchdog never changes recording state. Only sessions in Auto are
//! registered, so a tick costs O(Auto sessions).

use crate::models::CameraId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

/// Percent below which the countdown is shown as a warning
pub const WARNING_PERCENT: f64 = 30.0;

/// Watchdog configuration
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Idle time after which an Auto recording is considered abandoned
    pub threshold: Duration,
    pub tick_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(60),
            tick_interval: Duration::from_millis(200),
        }
    }
}

/// Derived countdown values for one session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceReading {
    pub time_remaining: Duration,
    /// 0..=100
    pub timeout_percent: f64,
    pub is_warning: bool,
}

impl PresenceReading {
    /// Reading for sessions that are not in Auto
    pub fn inactive() -> Self {
        Self {
            time_remaining: Duration::ZERO,
            timeout_percent: 0.0,
            is_warning: false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.time_remaining.is_zero()
    }
}

/// timeRemaining = max(0, threshold - elapsed); percent = 100 * remaining / threshold
pub fn evaluate(threshold: Duration, elapsed: Duration) -> PresenceReading {
    let time_remaining = threshold.saturating_sub(elapsed);
    let timeout_percent = if threshold.is_zero() {
        0.0
    } else {
        100.0 * time_remaining.as_secs_f64() / threshold.as_secs_f64()
    };

    PresenceReading {
        time_remaining,
        timeout_percent,
        is_warning: timeout_percent > 0.0 && timeout_percent < WARNING_PERCENT,
    }
}

/// Signal delivered to a registered session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogSignal {
    /// Countdown has been at zero for `ticks` consecutive ticks (always > 1)
    Expired { ticks: u32 },
}

struct WatchEntry {
    last_presence_at: Instant,
    expired_ticks: u32,
    signal_tx: mpsc::UnboundedSender<WatchdogSignal>,
}

pub type ReadingMap = Arc<HashMap<CameraId, PresenceReading>>;

/// PresenceWatchdog instance
pub struct PresenceWatchdog {
    config: WatchdogConfig,
    entries: RwLock<HashMap<CameraId, WatchEntry>>,
    readings_tx: watch::Sender<ReadingMap>,
    running: RwLock<bool>,
}

impl PresenceWatchdog {
    /// Create new PresenceWatchdog (not ticking until `start`)
    pub fn new(config: WatchdogConfig) -> Arc<Self> {
        let (readings_tx, _) = watch::channel(Arc::new(HashMap::new()));
        Arc::new(Self {
            config,
            entries: RwLock::new(HashMap::new()),
            readings_tx,
            running: RwLock::new(false),
        })
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Start the shared tick
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("PresenceWatchdog already running");
                return;
            }
            *running = true;
        }

        tracing::info!(
            threshold_sec = self.config.threshold.as_secs(),
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Starting presence watchdog"
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let tick_interval = self.config.tick_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let Some(watchdog) = weak.upgrade() else {
                    break;
                };
                if !*watchdog.running.read().await {
                    break;
                }
                watchdog.tick().await;
            }

            tracing::info!("Presence watchdog stopped");
        });
    }

    /// Stop the shared tick
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        tracing::info!("Stopping presence watchdog");
    }

    /// Register (or re-register) an Auto session
    pub async fn watch(
        &self,
        camera_id: CameraId,
        last_presence_at: Instant,
        signal_tx: mpsc::UnboundedSender<WatchdogSignal>,
    ) {
        let mut entries = self.entries.write().await;
        entries.insert(
            camera_id,
            WatchEntry {
                last_presence_at,
                expired_ticks: 0,
                signal_tx,
            },
        );
        tracing::debug!(camera_id = %camera_id, active = entries.len(), "Watchdog registered");
    }

    /// Record a presence signal
    pub async fn touch(&self, camera_id: CameraId, at: Instant) {
        if let Some(entry) = self.entries.write().await.get_mut(&camera_id) {
            entry.last_presence_at = at;
            entry.expired_ticks = 0;
        }
    }

    /// Remove a session from the active set
    pub async fn release(&self, camera_id: CameraId) {
        let removed = self.entries.write().await.remove(&camera_id).is_some();
        if removed {
            tracing::debug!(camera_id = %camera_id, "Watchdog released");
            self.readings_tx.send_modify(|readings| {
                if readings.contains_key(&camera_id) {
                    let mut next = (**readings).clone();
                    next.remove(&camera_id);
                    *readings = Arc::new(next);
                }
            });
        }
    }

    /// Countdown for one camera, computed now
    pub async fn reading(&self, camera_id: CameraId) -> PresenceReading {
        match self.entries.read().await.get(&camera_id) {
            Some(entry) => evaluate(self.config.threshold, entry.last_presence_at.elapsed()),
            None => PresenceReading::inactive(),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Readings published on every tick
    pub fn subscribe(&self) -> watch::Receiver<ReadingMap> {
        self.readings_tx.subscribe()
    }

    /// One pass over the active set
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut readings = HashMap::new();
        let mut entries = self.entries.write().await;

        entries.retain(|camera_id, entry| {
            let reading = evaluate(
                self.config.threshold,
                now.saturating_duration_since(entry.last_presence_at),
            );

            if reading.is_expired() {
                entry.expired_ticks = entry.expired_ticks.saturating_add(1);
                if entry.expired_ticks > 1 {
                    let signal = WatchdogSignal::Expired {
                        ticks: entry.expired_ticks,
                    };
                    if entry.signal_tx.send(signal).is_err() {
                        tracing::debug!(camera_id = %camera_id, "Dropping watchdog entry of closed session");
                        return false;
                    }
                }
            } else {
                entry.expired_ticks = 0;
            }

            readings.insert(*camera_id, reading);
            true
        });
        drop(entries);

        self.readings_tx.send_replace(Arc::new(readings));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_evaluate_countdown() {
        let threshold = Duration::from_secs(60);

        let fresh = evaluate(threshold, Duration::ZERO);
        assert!(approx(fresh.timeout_percent, 100.0));
        assert!(!fresh.is_warning);

        let later = evaluate(threshold, Duration::from_secs(45));
        assert!(approx(later.timeout_percent, 25.0));
        assert_eq!(later.time_remaining, Duration::from_secs(15));
        assert!(later.is_warning);

        let expired = evaluate(threshold, Duration::from_secs(90));
        assert_eq!(expired.timeout_percent, 0.0);
        assert!(expired.is_expired());
        assert!(!expired.is_warning);
    }

    #[test]
    fn test_countdown_strictly_decreasing_then_zero() {
        let threshold = Duration::from_secs(60);
        let mut previous = f64::MAX;
        for t in 0..60u64 {
            let reading = evaluate(threshold, Duration::from_secs(t));
            let expected = 100.0 * (60 - t) as f64 / 60.0;
            assert!(approx(reading.timeout_percent, expected));
            assert!(reading.timeout_percent < previous);
            previous = reading.timeout_percent;
        }
        for t in 60..200u64 {
            let reading = evaluate(threshold, Duration::from_secs(t));
            assert_eq!(reading.timeout_percent, 0.0);
            assert!(reading.timeout_percent >= 0.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reading_tracks_presence() {
        let watchdog = PresenceWatchdog::new(WatchdogConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let cam = CameraId(7);

        assert_eq!(watchdog.reading(cam).await, PresenceReading::inactive());

        watchdog.watch(cam, Instant::now(), tx).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(approx(watchdog.reading(cam).await.timeout_percent, 50.0));

        watchdog.touch(cam, Instant::now()).await;
        assert!(approx(watchdog.reading(cam).await.timeout_percent, 100.0));

        watchdog.release(cam).await;
        assert_eq!(watchdog.reading(cam).await, PresenceReading::inactive());
        assert_eq!(watchdog.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_signalled_after_second_tick() {
        let watchdog = PresenceWatchdog::new(WatchdogConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cam = CameraId(1);

        watchdog.watch(cam, Instant::now(), tx).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        watchdog.tick().await;
        assert!(rx.try_recv().is_err());

        watchdog.tick().await;
        assert_eq!(rx.try_recv().unwrap(), WatchdogSignal::Expired { ticks: 2 });

        watchdog.touch(cam, Instant::now()).await;
        watchdog.tick().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_only_covers_registered_sessions() {
        let watchdog = PresenceWatchdog::new(WatchdogConfig::default());
        let mut readings = watchdog.subscribe();
        let (tx, _rx) = mpsc::unbounded_channel();

        watchdog.watch(CameraId(2), Instant::now(), tx).await;
        watchdog.tick().await;

        let published = readings.borrow_and_update().clone();
        assert_eq!(published.len(), 1);
        assert!(published.contains_key(&CameraId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sessions_are_pruned() {
        let watchdog = PresenceWatchdog::new(WatchdogConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        watchdog.watch(CameraId(4), Instant::now(), tx).await;
        drop(rx);

        tokio::time::advance(Duration::from_secs(120)).await;
        watchdog.tick().await;
        watchdog.tick().await;
        assert_eq!(watchdog.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tick_runs() {
        let watchdog = PresenceWatchdog::new(WatchdogConfig {
            threshold: Duration::from_secs(1),
            tick_interval: Duration::from_millis(200),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        watchdog.watch(CameraId(9), Instant::now(), tx).await;
        watchdog.start().await;

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(signal, WatchdogSignal::Expired { ticks } if ticks >= 2));

        watchdog.stop().await;
    }
}
