use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Windowed rate gate used by the job workers. Callers `acquire()` before
/// starting a handler; once the window's budget is spent the call sleeps
/// until the window rolls over.
pub struct RateGate {
    max_per_window: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    window_start: Instant,
    used: u32,
}

impl RateGate {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                used: 0,
            }),
        }
    }

    /// `max_per_second` of zero disables the gate.
    pub fn per_second(max_per_second: u32) -> Self {
        Self::new(max_per_second, Duration::from_secs(1))
    }

    pub async fn acquire(&self) {
        if self.max_per_window == 0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.window_start.elapsed();
                if elapsed >= self.window {
                    state.window_start = Instant::now();
                    state.used = 0;
                }
                if state.used < self.max_per_window {
                    state.used += 1;
                    None
                } else {
                    Some(self.window.saturating_sub(elapsed))
                }
            };

            match wait {
                None => return,
                Some(d) => sleep(d.max(Duration::from_millis(1))).await,
            }
        }
    }

    pub async fn current_window_count(&self) -> u32 {
        let state = self.state.lock().await;
        if state.window_start.elapsed() >= self.window {
            0
        } else {
            state.used
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_admits_up_to_budget_without_waiting() {
        let gate = RateGate::new(5, Duration::from_secs(10));
        let start = Instant::now();
        for _ in 0..5 {
            gate.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(gate.current_window_count().await, 5);
    }

    #[tokio::test]
    async fn gate_blocks_past_budget_until_window_rolls() {
        let gate = RateGate::new(2, Duration::from_millis(50));
        gate.acquire().await;
        gate.acquire().await;

        let start = Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn zero_budget_disables_gate() {
        let gate = RateGate::per_second(0);
        let start = Instant::now();
        for _ in 0..100 {
            gate.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
