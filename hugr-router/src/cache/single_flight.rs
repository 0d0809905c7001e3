//! At most one concurrent build per fingerprint on a node: losers of the race
//! await the winner's broadcast. A cancelled winner closes the channel, and
//! its followers race again to pick a new winner.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hugr_core::error::HugrError;
use tokio::sync::broadcast;

use super::CachedResponse;

type BuildResult = Result<CachedResponse, HugrError>;

#[derive(Default)]
pub struct SingleFlight {
    in_flight: DashMap<String, broadcast::Sender<BuildResult>>,
}

/// Removes the in-flight entry when the winner is dropped before finishing,
/// so followers do not wait on a build that will never complete.
struct FlightGuard<'a> {
    flights: &'a DashMap<String, broadcast::Sender<BuildResult>>,
    key: String,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flights.remove(&self.key);
        }
    }
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs `build` unless an identical build is already in flight, in which
    /// case the caller awaits that build's result.
    pub async fn run<F, Fut>(&self, key: &str, build: F) -> BuildResult
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = BuildResult>,
    {
        loop {
            let sender = match self.in_flight.entry(key.to_owned()) {
                Entry::Occupied(existing) => {
                    let mut receiver = existing.get().subscribe();
                    drop(existing);
                    match receiver.recv().await {
                        Ok(result) => return result,
                        // The winner was cancelled; race for a new winner.
                        Err(_) => continue,
                    }
                }
                Entry::Vacant(vacant) => {
                    let (sender, _) = broadcast::channel(1);
                    vacant.insert(sender.clone());
                    sender
                }
            };

            let mut guard = FlightGuard {
                flights: &self.in_flight,
                key: key.to_owned(),
                armed: true,
            };
            let result = build().await;
            guard.armed = false;
            self.in_flight.remove(key);
            let _ = sender.send(result.clone());
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            body: body.to_owned(),
            content_type: "application/json".to_owned(),
        }
    }

    #[tokio::test]
    async fn concurrent_identical_requests_build_once() {
        let flights = SingleFlight::new();
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flights = Arc::clone(&flights);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                flights
                    .run("fingerprint", || {
                        let builds = Arc::clone(&builds);
                        async move {
                            builds.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok(response("built"))
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            let result = handle.await.expect("task").expect("build");
            assert_eq!(result.body, "built");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_fingerprints_build_independently() {
        let flights = SingleFlight::new();
        let builds = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let builds = Arc::clone(&builds);
            flights
                .run(key, || {
                    let builds = Arc::clone(&builds);
                    async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        Ok(response(key))
                    }
                })
                .await
                .expect("build");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_winner_hands_off_to_a_follower() {
        let flights = SingleFlight::new();

        // The first winner stalls and is aborted mid-build.
        let stalled = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run("key", || async {
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        Ok(response("never"))
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let follower = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights.run("key", || async { Ok(response("follower")) }).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        stalled.abort();

        let result = follower.await.expect("task").expect("build");
        assert_eq!(result.body, "follower");
    }
}
