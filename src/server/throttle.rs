//! Failed-authentication throttling, keyed by remote IP.
//!
//! Each failure pushes the address's next-accept time further out along
//! the configured delay curve; the wait is imposed on the next credential
//! check, not on the socket, so an already-connected client can still
//! QUIT promptly. Records survive the session (they are per-address) and
//! decay after a quiet cooldown or a successful login.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

struct Record {
    failures: u32,
    next_accept: Instant,
}

pub struct AuthThrottle {
    curve: Vec<Duration>,
    cooldown: Duration,
    inner: Mutex<HashMap<IpAddr, Record>>,
}

impl AuthThrottle {
    /// `curve_seconds[n]` is the delay after the (n+1)th consecutive
    /// failure; the last entry caps everything beyond it.
    pub fn new(curve_seconds: &[u64], cooldown: Duration) -> Self {
        let curve = if curve_seconds.is_empty() {
            vec![Duration::ZERO]
        } else {
            curve_seconds.iter().map(|&s| Duration::from_secs(s)).collect()
        };
        Self {
            curve,
            cooldown,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Sleeps until the address is allowed another credential check.
    /// This is the session task's suspension point, so a disconnect (or
    /// shutdown abort) cancels the wait along with the task.
    pub async fn acquire(&self, addr: IpAddr) {
        let wait = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            self.expire_stale(&mut map, addr);
            map.get(&addr)
                .map(|r| r.next_accept.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Advances the address along the delay curve.
    pub fn record_failure(&self, addr: IpAddr) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.expire_stale(&mut map, addr);
        let record = map.entry(addr).or_insert(Record {
            failures: 0,
            next_accept: Instant::now(),
        });
        record.failures += 1;
        let step = (record.failures as usize - 1).min(self.curve.len() - 1);
        record.next_accept = Instant::now() + self.curve[step];
    }

    /// A successful login clears the address's record.
    pub fn record_success(&self, addr: IpAddr) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&addr);
    }

    fn expire_stale(&self, map: &mut HashMap<IpAddr, Record>, addr: IpAddr) {
        if let Some(record) = map.get(&addr) {
            if Instant::now() >= record.next_accept + self.cooldown {
                map.remove(&addr);
            }
        }
    }

    /// The delay the next failure from this address would incur; used by
    /// tests to observe curve progression.
    pub fn current_delay(&self, addr: IpAddr) -> Duration {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&addr)
            .map(|r| r.next_accept.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}
