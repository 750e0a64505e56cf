use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// 指数退避策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn exponential(initial: Duration) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
        }
    }

    /// 计算第 n 次重试的延迟
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial.as_secs_f64() * self.multiplier.powf(attempt as f64);
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay.max(0.0))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

/// Pending wake-ups, one per key. When a timer elapses `(key, seq)` is sent on
/// the channel handed to `schedule`; the receiver is expected to call `fired`
/// with both, which rejects wake-ups from timers that were replaced or cancelled.
pub struct BackoffTimers<K> {
    timers: HashMap<K, (u64, JoinHandle<()>)>,
    next_seq: u64,
}

impl<K> BackoffTimers<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Replaces any timer already pending for `key`.
    pub fn schedule(&mut self, key: K, delay: Duration, wake_tx: mpsc::UnboundedSender<(K, u64)>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!("backoff: {:?} wakes in {:?} (#{})", key, delay, seq);

        let wake_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wake_tx.send((wake_key, seq));
        });

        if let Some((_, previous)) = self.timers.insert(key, (seq, handle)) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, key: &K) {
        if let Some((_, handle)) = self.timers.remove(key) {
            handle.abort();
        }
    }

    /// Clears the entry if `seq` is the live timer for `key`. Returns false for stale wake-ups.
    pub fn fired(&mut self, key: &K, seq: u64) -> bool {
        match self.timers.get(key) {
            Some((live, _)) if *live == seq => {
                self.timers.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl<K> Default for BackoffTimers<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for BackoffTimers<K> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }
}
