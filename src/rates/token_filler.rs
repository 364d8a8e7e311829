//! Background refill thread for a [`TokenPool`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use typed_builder::TypedBuilder;

use super::token_pool::TokenPool;
use super::RateSpec;
use crate::error::{Error, Result};

/// Configures a dedicated thread that tops up a token pool roughly once per
/// millisecond. Scheduling jitter is absorbed by refilling with the *actual*
/// elapsed time since the previous refill, so the long-term token rate
/// matches wall clock exactly.
#[derive(TypedBuilder)]
pub struct TokenFiller {
    spec: RateSpec,
    #[builder(setter(into))]
    label: String,
    #[builder(default = 1.1)]
    burst_ratio: f64,
    #[builder(default = Duration::from_millis(1))]
    interval: Duration,
}

impl TokenFiller {
    /// Spawn the filler thread. The pool starts seeded with one op's worth
    /// of schedule so the first caller is not starved.
    pub fn start(self) -> Result<TokenFillerHandle> {
        let pool = Arc::new(TokenPool::from_spec(&self.spec, self.burst_ratio)?);
        pool.refill(self.spec.nanos_per_op());

        let running = Arc::new(AtomicBool::new(true));
        let name = format!("token-filler-{}", self.label);
        let thread = {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let interval = self.interval;
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    tracing::debug!(interval = ?interval, "token filler running");
                    let mut last_refill = Instant::now();
                    while running.load(Ordering::Relaxed) {
                        let deadline = last_refill + interval;
                        let mut now = Instant::now();
                        while now < deadline {
                            thread::sleep(deadline - now);
                            now = Instant::now();
                        }
                        let delta = now.duration_since(last_refill);
                        last_refill = now;
                        pool.refill(delta.as_nanos() as i64);
                    }
                })
                .map_err(|source| Error::ThreadSpawn { name, source })?
        };

        Ok(TokenFillerHandle {
            pool,
            running,
            thread,
        })
    }
}

/// Owner handle for a running filler thread.
pub struct TokenFillerHandle {
    pool: Arc<TokenPool>,
    running: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl TokenFillerHandle {
    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    /// Rescale the pool for a new rate without restarting the thread.
    pub fn apply(&self, spec: &RateSpec) -> Result<()> {
        self.pool.apply(spec)
    }

    /// Stop the refill thread and wait for it to exit.
    pub fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        if self.thread.join().is_err() {
            tracing::error!("token filler thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filler_accumulates_wall_clock_time() {
        let spec = RateSpec::new(1000.0, 0.0).unwrap();
        let handle = TokenFiller::builder()
            .spec(spec)
            .label("test")
            .build()
            .start()
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        // ~50ms of schedule accumulated against a 10ms pool: the active
        // bucket should be pinned at its burst cap.
        let active = handle.pool().active_pool();
        let cap = (handle.pool().pool_size() as f64 * 1.1) as i64;
        assert_eq!(active, cap);

        let taken = handle.pool().take_up_to(5_000_000);
        assert_eq!(taken, 5_000_000);
        handle.stop();
    }

    #[test]
    fn stop_joins_the_thread() {
        let spec = RateSpec::new(100.0, 0.0).unwrap();
        let handle = TokenFiller::builder()
            .spec(spec)
            .label("stopper")
            .build()
            .start()
            .unwrap();
        thread::sleep(Duration::from_millis(5));
        handle.stop();
    }
}
