// Copyright 2024 AION Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-client sliding-window rate limiting for the submission endpoint.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use aion_relayer_config::RateLimitConfig;

/// A sliding-window counter per client address. A request passes when
/// fewer than `max_requests` earlier requests fall inside the window.
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl SlidingWindow {
    /// Creates the limiter from the configured bounds.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests as usize,
            window: Duration::from_secs(config.window_secs),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a request from `client`. Returns `Err(retry_after_secs)`
    /// when the client exhausted its window.
    pub fn check(&self, client: IpAddr) -> Result<(), u64> {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        let entry = hits.entry(client).or_default();
        while let Some(oldest) = entry.front() {
            if now.duration_since(*oldest) >= self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= self.max_requests {
            let oldest = entry.front().copied().unwrap_or(now);
            let elapsed = now.duration_since(oldest);
            let retry_after =
                self.window.saturating_sub(elapsed).as_secs().max(1);
            return Err(retry_after);
        }
        entry.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64) -> SlidingWindow {
        SlidingWindow::new(&RateLimitConfig {
            max_requests,
            window_secs,
        })
    }

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = limiter(3, 60);
        let client: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..3 {
            assert!(limiter.check(client).is_ok());
        }
        let retry_after = limiter.check(client).unwrap_err();
        assert!(retry_after >= 1 && retry_after <= 60);
    }

    #[test]
    fn clients_are_tracked_independently() {
        let limiter = limiter(1, 60);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(b).is_ok());
        assert!(limiter.check(a).is_err());
    }

    #[test]
    fn the_window_slides() {
        let limiter = limiter(2, 1);
        let client: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check(client).is_ok());
        assert!(limiter.check(client).is_ok());
        assert!(limiter.check(client).is_err());
        std::thread::sleep(Duration::from_millis(1_050));
        assert!(limiter.check(client).is_ok());
    }
}
