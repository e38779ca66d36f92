//! Component supervision: respawn panicked actor loops within a restart
//! intensity budget.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::config::SupervisorConfig;

/// How many restarts are tolerated within a sliding window.
#[derive(Debug, Clone, Copy)]
pub struct RestartIntensity {
    pub max_restarts: u32,
    pub max_seconds: u64,
}

impl From<&SupervisorConfig> for RestartIntensity {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            max_seconds: config.max_seconds,
        }
    }
}

/// Keep a component actor alive.
///
/// `factory(generation)` spawns the actor loop; generation 0 is the
/// initial spawn and each respawn increments it, letting components run
/// their restart recovery path (e.g. a worker supervisor flushing its
/// table as `supervisor_restart` exits). A loop that returns normally
/// ends supervision -- that is the orderly path when every handle to the
/// component's inbox is gone. A panic respawns the loop unless more than
/// `max_restarts` panics landed within the last `max_seconds`.
pub(crate) fn supervise<F>(
    name: &'static str,
    intensity: RestartIntensity,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut(u32) -> JoinHandle<()> + Send + 'static,
{
    tokio::spawn(async move {
        let window = Duration::from_secs(intensity.max_seconds);
        let mut recent: VecDeque<Instant> = VecDeque::new();
        let mut generation: u32 = 0;

        loop {
            let child = factory(generation);
            match child.await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    let now = Instant::now();
                    recent.push_back(now);
                    while recent
                        .front()
                        .is_some_and(|t| now.duration_since(*t) > window)
                    {
                        recent.pop_front();
                    }

                    if recent.len() as u32 > intensity.max_restarts {
                        tracing::error!(
                            component = name,
                            restarts = recent.len(),
                            window_seconds = intensity.max_seconds,
                            "restart intensity exceeded, component stays down"
                        );
                        return;
                    }

                    generation += 1;
                    tracing::warn!(component = name, generation, "component panicked, restarting");
                }
                // Aborted from outside: node shutdown.
                Err(_) => return,
            }
        }
    })
}

/// Extract a readable message from a panicked task's join error.
pub(crate) fn panic_message(e: tokio::task::JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "worker panicked".to_string()
            }
        }
        Err(_) => "worker cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn respawns_after_panic_until_loop_finishes() {
        let spawns = Arc::new(AtomicU32::new(0));
        let spawns_clone = Arc::clone(&spawns);

        let intensity = RestartIntensity {
            max_restarts: 5,
            max_seconds: 10,
        };
        let handle = supervise("test", intensity, move |_generation| {
            let spawns = Arc::clone(&spawns_clone);
            tokio::spawn(async move {
                if spawns.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("induced");
                }
            })
        });

        handle.await.unwrap();
        assert_eq!(spawns.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_past_intensity_budget() {
        let spawns = Arc::new(AtomicU32::new(0));
        let spawns_clone = Arc::clone(&spawns);

        let intensity = RestartIntensity {
            max_restarts: 2,
            max_seconds: 10,
        };
        let handle = supervise("test", intensity, move |_generation| {
            spawns_clone.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move { panic!("always") })
        });

        handle.await.unwrap();
        // Initial spawn plus two tolerated restarts.
        assert_eq!(spawns.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn generation_increments_on_respawn() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);

        let intensity = RestartIntensity {
            max_restarts: 5,
            max_seconds: 10,
        };
        let handle = supervise("test", intensity, move |generation| {
            seen_clone.store(generation, Ordering::SeqCst);
            tokio::spawn(async move {
                if generation == 0 {
                    panic!("first run dies");
                }
            })
        });

        handle.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
