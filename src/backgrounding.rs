use parking_lot::Mutex;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;

use crate::subscriptions::{Subscription, Subscriptions};

/// Held by a subscriber that needs time to wind down before the
/// process sleeps; the phase completes once every notifier is
/// dropped.
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    outstanding: Arc<AtomicUsize>,
    wake: Arc<Notify>,
}

impl Drop for NotifierInner {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}

pub trait BackgroundingObserver: Send + Sync {
    /// the application is heading to the background; hold the
    /// notifier until ready (or drop it immediately when nothing
    /// needs flushing).
    fn on_going_to_background(&self, notifier: Notifier);

    fn on_returning_from_background(&self);
}

/// Process-wide backgrounding fan-out.
///
/// Subscribers sign up under a numbered phase; when the application
/// announces backgrounding, phases are notified in ascending order and
/// each phase is given until its notifiers drop or the phase timeout
/// expires before the next phase starts.
#[derive(Default)]
pub struct Backgrounding {
    phases: Mutex<BTreeMap<u8, Arc<Subscriptions<dyn BackgroundingObserver>>>>,
}

static SERVICE: OnceLock<Backgrounding> = OnceLock::new();

impl Backgrounding {
    pub fn singleton() -> &'static Self {
        SERVICE.get_or_init(Self::default)
    }

    pub fn subscribe(&self, phase: u8, observer: Arc<dyn BackgroundingObserver>) -> Subscription {
        let subs = {
            let mut phases = self.phases.lock();
            phases.entry(phase).or_default().clone()
        };

        subs.subscribe(observer)
    }

    /// announce backgrounding; resolves once every phase released its
    /// notifiers or timed out.
    pub async fn go_to_background(&self, phase_timeout: Duration) {
        let snapshot: Vec<Arc<Subscriptions<dyn BackgroundingObserver>>> = {
            let phases = self.phases.lock();
            phases.values().cloned().collect()
        };

        for subs in snapshot {
            let outstanding = Arc::new(AtomicUsize::new(0));
            let wake = Arc::new(Notify::new());

            subs.for_each(|observer| {
                outstanding.fetch_add(1, Ordering::SeqCst);
                observer.on_going_to_background(Notifier {
                    inner: Arc::new(NotifierInner {
                        outstanding: outstanding.clone(),
                        wake: wake.clone(),
                    }),
                });
            });

            let deadline = tokio::time::Instant::now() + phase_timeout;
            while outstanding.load(Ordering::SeqCst) > 0 {
                if tokio::time::timeout_at(deadline, wake.notified())
                    .await
                    .is_err()
                {
                    log::warn!("backgrounding phase timed out with notifiers outstanding");
                    break;
                }
            }
        }
    }

    pub fn return_from_background(&self) {
        let snapshot: Vec<Arc<Subscriptions<dyn BackgroundingObserver>>> = {
            let phases = self.phases.lock();
            phases.values().cloned().collect()
        };

        for subs in snapshot {
            subs.for_each(|observer| observer.on_returning_from_background());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct Holder {
        held: PlMutex<Option<Notifier>>,
        resumed: AtomicUsize,
    }

    impl BackgroundingObserver for Holder {
        fn on_going_to_background(&self, notifier: Notifier) {
            *self.held.lock() = Some(notifier);
        }

        fn on_returning_from_background(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_notifier_release_and_times_out() {
        let service = Backgrounding::default();
        let holder = Arc::new(Holder {
            held: PlMutex::new(None),
            resumed: AtomicUsize::new(0),
        });
        let _sub = service.subscribe(1, holder.clone());

        // release after a delay shorter than the timeout.
        let releaser = holder.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.held.lock().take();
        });

        service.go_to_background(Duration::from_secs(5)).await;
        assert!(holder.held.lock().is_none());

        service.return_from_background();
        assert_eq!(holder.resumed.load(Ordering::SeqCst), 1);

        // a notifier that never releases only stalls its phase until
        // the timeout.
        service.go_to_background(Duration::from_millis(20)).await;
        assert!(holder.held.lock().is_some());
    }
}
