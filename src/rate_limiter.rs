use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use http::HeaderMap;
use tracing::{debug, info, warn};

pub const APP_RATE_LIMIT_HEADER: &str = "x-app-rate-limit";
pub const METHOD_RATE_LIMIT_HEADER: &str = "x-method-rate-limit";

/// One advertised `limit:window` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub limit: u32,
    pub seconds: u64,
}

impl Window {
    fn rate(&self) -> f64 {
        f64::from(self.limit) / self.seconds as f64
    }
}

#[derive(Clone)]
struct WindowLimiter {
    window: Window,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl WindowLimiter {
    fn new(window: Window) -> Option<Self> {
        let burst = NonZeroU32::new(window.limit)?;
        let period = Duration::from_secs(window.seconds) / window.limit;
        let quota = Quota::with_period(period)?.allow_burst(burst);
        Some(Self {
            window,
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }
}

/// Parses `20:1,100:120` into windows, skipping malformed pairs.
pub fn parse_rate_limit_header(value: &str) -> Vec<Window> {
    value
        .split(',')
        .filter_map(|pair| {
            let (limit, seconds) = pair.trim().split_once(':')?;
            let limit = limit.trim().parse::<u32>().ok()?;
            let seconds = seconds.trim().parse::<u64>().ok()?;
            (limit > 0 && seconds > 0).then_some(Window { limit, seconds })
        })
        .collect()
}

/// Quota tracker shared by every upstream call made with the same API key.
///
/// Limits are learnt from response headers, so nothing is throttled until the first
/// response has been seen. Each app window gets its own token bucket; a bucket is replaced
/// whenever the limit advertised for its window changes. Method limits are tracked per
/// endpoint, since each endpoint advertises its own.
#[derive(Default)]
pub struct AdaptiveRateLimiter {
    app: RwLock<BTreeMap<u64, WindowLimiter>>,
    methods: RwLock<HashMap<String, WindowLimiter>>,
}

impl AdaptiveRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_from_headers(&self, method: &str, headers: &HeaderMap) {
        if let Some(value) = header_str(headers, APP_RATE_LIMIT_HEADER) {
            self.update_app_windows(&parse_rate_limit_header(value));
        }
        if let Some(value) = header_str(headers, METHOD_RATE_LIMIT_HEADER) {
            self.update_method_window(method, &parse_rate_limit_header(value));
        }
    }

    pub fn update_app_windows(&self, windows: &[Window]) {
        let mut app = match self.app.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for window in windows {
            let unchanged = app
                .get(&window.seconds)
                .is_some_and(|current| current.window.limit == window.limit);
            if unchanged {
                continue;
            }
            if let Some(limiter) = WindowLimiter::new(*window) {
                info!(
                    "App rate limit now {} requests per {}s",
                    window.limit, window.seconds
                );
                app.insert(window.seconds, limiter);
            }
        }
    }

    /// Keeps one bucket per endpoint for its most restrictive advertised window.
    pub fn update_method_window(&self, method: &str, windows: &[Window]) {
        let Some(tightest) = windows
            .iter()
            .min_by(|a, b| a.rate().total_cmp(&b.rate()))
            .copied()
        else {
            return;
        };
        let mut methods = match self.methods.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if methods.get(method).is_some_and(|m| m.window == tightest) {
            return;
        }
        if let Some(limiter) = WindowLimiter::new(tightest) {
            info!(
                "Method rate limit for {} now {} requests per {}s",
                method, tightest.limit, tightest.seconds
            );
            methods.insert(method.to_string(), limiter);
        }
    }

    /// Windows enforced for `method`, its own window first.
    #[cfg(test)]
    pub fn active_windows(&self, method: &str) -> Vec<Window> {
        self.snapshot(method).into_iter().map(|l| l.window).collect()
    }

    fn snapshot(&self, method: &str) -> Vec<WindowLimiter> {
        let mut limiters = Vec::new();
        if let Ok(methods) = self.methods.read() {
            limiters.extend(methods.get(method).cloned());
        }
        if let Ok(app) = self.app.read() {
            limiters.extend(app.values().cloned());
        }
        limiters
    }

    /// Takes one token from every bucket that applies to `method`, sleeping once per
    /// bucket that is empty.
    pub async fn acquire(&self, method: &str) {
        let clock = DefaultClock::default();
        for bucket in self.snapshot(method) {
            let Err(not_until) = bucket.limiter.check() else {
                continue;
            };
            let wait = not_until.wait_time_from(clock.now());
            debug!(
                "Quota {}:{} exhausted, waiting {:?}",
                bucket.window.limit, bucket.window.seconds, wait
            );
            tokio::time::sleep(wait).await;
            if bucket.limiter.check().is_err() {
                warn!(
                    "Quota {}:{} still exhausted after waiting, sending anyway",
                    bucket.window.limit, bucket.window.seconds
                );
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
