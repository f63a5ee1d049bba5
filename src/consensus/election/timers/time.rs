use tokio::time::{Duration, Instant};

/// Source of time for timer tasks, so tests can drive timers by hand.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) use manual::{manual_clock, ClockDriver, ManualClock};


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Instant>) {
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn sleepers_wake_only_once_their_deadline_passes() {
        let (clock, mut driver) = manual_clock();
        let (woke_tx, mut woke_rx) = mpsc::unbounded_channel();

        for delay_ms in [300u64, 100, 200].iter().copied() {
            let mut clock = clock.clone();
            let woke_tx = woke_tx.clone();
            tokio::spawn(async move {
                clock.sleep(Duration::from_millis(delay_ms)).await;
                let _ = woke_tx.send(clock.now());
            });
        }

        driver.advance(Duration::from_millis(50));
        assert_quiet(&mut woke_rx).await;

        driver.advance(Duration::from_millis(100));
        let woke_at = woke_rx.recv().await.unwrap();
        assert_eq!(woke_at, clock.now());
        assert_quiet(&mut woke_rx).await;

        // One big jump releases everyone still waiting.
        driver.advance(Duration::from_secs(1));
        woke_rx.recv().await.unwrap();
        woke_rx.recv().await.unwrap();
        assert_quiet(&mut woke_rx).await;

        assert_eq!(driver.elapsed(), Duration::from_millis(1150));
    }

    #[tokio::test]
    async fn real_clock_sleeps_for_real() {
        let mut clock = RealClock;
        let before = clock.now();
        clock.sleep(Duration::from_millis(10)).await;
        assert!(clock.now() - before >= Duration::from_millis(10));
    }
}
