/// Per-IP admission control.
///
/// Bounds the number of concurrently served sessions per source IP. All
/// mutations happen under a single mutex with an O(1) critical section,
/// and a count that reaches zero is removed rather than stored.
use fnv::FnvHashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

pub struct AdmissionControl {
    max: u32,
    counts: Mutex<FnvHashMap<IpAddr, u32>>,
}

impl AdmissionControl {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            counts: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Admit a session from `ip`, or return `None` when the per-IP cap is
    /// already reached. The returned permit decrements the count when
    /// dropped, on every exit path of the holder.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<AdmissionPermit> {
        let mut counts = self.counts.lock().unwrap();
        let current = counts.get(&ip).copied().unwrap_or(0);
        if current >= self.max {
            return None;
        }
        counts.insert(ip, current + 1);
        Some(AdmissionPermit {
            control: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        let mut counts = self.counts.lock().unwrap();
        match counts.get(&ip).copied() {
            // delete rather than keeping entries with 0 connections
            Some(1) => {
                counts.remove(&ip);
            }
            Some(current) => {
                counts.insert(ip, current - 1);
            }
            None => {}
        }
    }

    /// Number of sessions currently admitted from `ip`.
    pub fn active(&self, ip: IpAddr) -> u32 {
        self.counts.lock().unwrap().get(&ip).copied().unwrap_or(0)
    }

    /// True when no IP has an admitted session.
    pub fn is_empty(&self) -> bool {
        self.counts.lock().unwrap().is_empty()
    }
}

/// Scope guard for one admitted session.
pub struct AdmissionPermit {
    control: Arc<AdmissionControl>,
    ip: IpAddr,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.control.release(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_admission_bound() {
        let control = Arc::new(AdmissionControl::new(2));

        let first = control.try_acquire(ip(1)).unwrap();
        let second = control.try_acquire(ip(1)).unwrap();
        assert!(control.try_acquire(ip(1)).is_none());

        // A different IP has its own allowance.
        let other = control.try_acquire(ip(2)).unwrap();

        drop(first);
        let third = control.try_acquire(ip(1)).unwrap();
        assert_eq!(control.active(ip(1)), 2);

        drop(second);
        drop(third);
        drop(other);
        assert!(control.is_empty());
    }

    #[test]
    fn test_no_zero_valued_entries() {
        let control = Arc::new(AdmissionControl::new(4));
        let permit = control.try_acquire(ip(9)).unwrap();
        assert_eq!(control.active(ip(9)), 1);

        drop(permit);
        assert_eq!(control.active(ip(9)), 0);
        assert!(control.counts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_cap() {
        let control = Arc::new(AdmissionControl::new(8));
        let mut handles = Vec::new();

        for _ in 0..32 {
            let control = Arc::clone(&control);
            handles.push(tokio::spawn(async move {
                match control.try_acquire(ip(1)) {
                    Some(permit) => {
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        drop(permit);
                        true
                    }
                    None => false,
                }
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        // The cap bounds concurrency, not the total across retries.
        assert!(admitted >= 8);
        assert!(control.is_empty());
    }
}
