use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// A simple token bucket rate limiter.
///
/// Tokens accumulate at `rate_per_sec` up to a one-second burst capacity.
/// `acquire` blocks (via `tokio::time::sleep`, so it respects a paused test
/// clock) until a token is available, then consumes one.
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<State>,
}

struct State {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64) -> Self {
        let capacity = rate_per_sec.max(1.0);
        Self {
            rate_per_sec,
            capacity,
            state: Mutex::new(State {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until a token is available, then consume it. A request that
    /// would exceed the bucket sleeps until capacity is available; this is
    /// the synchronization point that keeps total throughput under the
    /// configured rate regardless of how many callers request concurrently.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}
