//! Readiness polling for freshly started containers.
//!
//! A probe that fails once is not a verdict: the prober keeps polling with
//! exponential backoff until the endpoint answers with a success status or
//! the time budget runs out.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2,
            cap: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th failed probe (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt);
        self.base.saturating_mul(multiplier).min(self.cap)
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Healthy,
    /// The endpoint answered with a non-success status.
    Unhealthy(u16),
    /// Connection refused, reset or timed out.
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// The endpoint answered, but never with success.
    Unhealthy,
    /// The endpoint never answered.
    TimedOut,
}

impl AsRef<str> for HealthOutcome {
    fn as_ref(&self) -> &str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::TimedOut => "timed out",
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> ProbeResult;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, endpoint: &str) -> ProbeResult {
        match self.client.get(endpoint).send().await {
            Ok(response) if response.status().is_success() => ProbeResult::Healthy,
            Ok(response) => ProbeResult::Unhealthy(response.status().as_u16()),
            Err(e) => {
                log::debug!("Probe of {endpoint} failed: {e}");
                ProbeResult::Unreachable
            }
        }
    }
}

#[derive(Clone)]
pub struct HealthProber {
    probe: Arc<dyn Probe>,
}

impl HealthProber {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe }
    }

    pub async fn wait_healthy(
        &self,
        service: &str,
        endpoint: &str,
        timeout: Duration,
        backoff: &BackoffPolicy,
    ) -> HealthOutcome {
        let deadline = Instant::now() + timeout;
        let mut answered = false;
        let mut attempt = 0;

        log::info!("Waiting up to {timeout:?} for {service} to become healthy at {endpoint}");

        loop {
            match tokio::time::timeout_at(deadline, self.probe.probe(endpoint)).await {
                Ok(ProbeResult::Healthy) => {
                    log::info!("{service} is healthy after {} probe(s)", attempt + 1);
                    return HealthOutcome::Healthy;
                }
                Ok(ProbeResult::Unhealthy(status)) => {
                    log::debug!("{service} answered {status} on probe {}", attempt + 1);
                    answered = true;
                }
                Ok(ProbeResult::Unreachable) => {
                    log::debug!("{service} unreachable on probe {}", attempt + 1);
                }
                Err(_) => break,
            }

            let next = Instant::now() + backoff.delay(attempt);
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            tokio::time::sleep_until(next).await;
            attempt += 1;
        }

        let outcome = if answered {
            HealthOutcome::Unhealthy
        } else {
            HealthOutcome::TimedOut
        };
        log::warn!(
            "{service} did not become healthy within {timeout:?}: {}",
            outcome.as_ref()
        );
        outcome
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    type Observer = Box<dyn Fn(&str) + Send + Sync>;

    /// Scripted probe: each endpoint answers from its queue, repeating the
    /// last entry once the queue is drained.
    #[derive(Default)]
    pub struct ScriptedProbe {
        scripts: Mutex<HashMap<String, VecDeque<ProbeResult>>>,
        observer: Mutex<Option<Observer>>,
        pub calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedProbe {
        pub fn script(&self, endpoint_contains: &str, results: &[ProbeResult]) {
            self.scripts
                .lock()
                .unwrap()
                .insert(endpoint_contains.to_string(), results.iter().copied().collect());
        }

        /// Run `observer` on every probe, before it is answered.
        pub fn observe(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
            *self.observer.lock().unwrap() = Some(Box::new(observer));
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, endpoint: &str) -> ProbeResult {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), Instant::now()));
            if let Some(observer) = self.observer.lock().unwrap().as_ref() {
                observer(endpoint);
            }
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts
                .iter_mut()
                .find(|(key, _)| endpoint.contains(key.as_str()))
                .map(|(_, script)| script);
            match script {
                Some(script) if script.len() > 1 => script.pop_front().unwrap(),
                Some(script) => script.front().copied().unwrap_or(ProbeResult::Unreachable),
                None => ProbeResult::Healthy,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedProbe;
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<_> = (0..7).map(|a| policy.delay(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
        assert_eq!(policy.delay(200), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_before_success_are_absorbed() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.script(
            "api",
            &[
                ProbeResult::Unreachable,
                ProbeResult::Unhealthy(503),
                ProbeResult::Unreachable,
                ProbeResult::Healthy,
            ],
        );
        let prober = HealthProber::new(probe.clone());

        let start = Instant::now();
        let outcome = prober
            .wait_healthy(
                "api",
                "http://10.0.0.2:80/api",
                Duration::from_secs(30),
                &BackoffPolicy::default(),
            )
            .await;

        assert_eq!(outcome, HealthOutcome::Healthy);
        let calls = probe.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        // 500ms + 1s + 2s of backoff between the four probes
        assert_eq!(calls[3].1 - start, Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_answering_times_out() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.script("db", &[ProbeResult::Unreachable]);
        let prober = HealthProber::new(probe.clone());

        let start = Instant::now();
        let outcome = prober
            .wait_healthy(
                "db",
                "http://10.0.0.3:5432/db",
                Duration::from_secs(10),
                &BackoffPolicy::default(),
            )
            .await;

        assert_eq!(outcome, HealthOutcome::TimedOut);
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answering_with_errors_is_unhealthy() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.script("web", &[ProbeResult::Unreachable, ProbeResult::Unhealthy(500)]);
        let prober = HealthProber::new(probe);

        let outcome = prober
            .wait_healthy(
                "web",
                "http://10.0.0.4:3000/web",
                Duration::from_secs(5),
                &BackoffPolicy::default(),
            )
            .await;

        assert_eq!(outcome, HealthOutcome::Unhealthy);
    }
}
