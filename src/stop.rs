// Cooperative stop signaling shared by all units.
//
// A stop request is polled, never preemptive: every loop re-checks at
// each suspension boundary, so exit latency is bounded by the longest
// single wait (receive timeout or current backoff sleep).
use std::time::Duration;
use tokio::sync::watch;

pub type StopSender = watch::Sender<bool>;
pub type StopReceiver = watch::Receiver<bool>;

pub fn channel() -> (StopSender, StopReceiver) {
    watch::channel(false)
}

pub fn is_stopped(rx: &StopReceiver) -> bool {
    *rx.borrow()
}

/// Resolves once a stop has been requested. A dropped sender counts as
/// a stop so orphaned units never hang.
pub async fn stopped(rx: &mut StopReceiver) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Sleeps for `dur`, returning true if a stop arrived during the wait.
pub async fn sleep_or_stop(rx: &mut StopReceiver, dur: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = stopped(rx) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_to_completion_without_a_stop() {
        let (_tx, mut rx) = channel();
        assert!(!sleep_or_stop(&mut rx, Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_sleep() {
        let (tx, mut rx) = channel();
        let waiter = tokio::spawn(async move { sleep_or_stop(&mut rx, Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).expect("signal");
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_counts_as_a_stop() {
        let (tx, mut rx) = channel();
        drop(tx);
        // Must resolve rather than hang.
        stopped(&mut rx).await;
    }

    #[tokio::test]
    async fn signaling_twice_is_harmless() {
        let (tx, rx) = channel();
        tx.send(true).expect("first");
        tx.send(true).expect("second");
        assert!(is_stopped(&rx));
    }
}
