// ================= 按节拍补水的令牌桶 =================

/// 节拍周期 (秒)
pub const TICK_SECS: f64 = 0.001;

#[derive(Debug, Default)]
pub struct TokenBucket {
    pub tokens: u64, // 当前余额 (字节)
    max_tokens: u64,      // 桶容量，约 0.1 秒的突发
    tokens_per_tick: u64, // 每个节拍补 1%
}

impl TokenBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按吞吐量 (kbps) 重算桶参数；余额会被压到新的上限以内
    pub fn set_rate(&mut self, kbps: i64) {
        let kbps = kbps.max(0) as f64;
        // 0.1 秒的容量
        self.max_tokens = (kbps * 1000.0 / 8.0 * 0.1) as u64;
        self.tokens = self.tokens.min(self.max_tokens);
        // 每 0.001 秒一拍
        self.tokens_per_tick = (self.max_tokens as f64 * 0.01) as u64;
    }

    /// 初始给满
    pub fn fill(&mut self) {
        self.tokens = self.max_tokens;
    }

    pub fn refill(&mut self) {
        self.tokens = (self.tokens + self.tokens_per_tick).min(self.max_tokens);
    }

    /// 余额够就扣掉并返回 true，不够什么都不动
    pub fn consume(&mut self, cost: u64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_follow_throughput() {
        let mut b = TokenBucket::new();
        b.set_rate(800);
        assert_eq!(b.max_tokens, 10_000);
        assert_eq!(b.tokens_per_tick, 100);
        assert_eq!(b.tokens, 0);
    }

    #[test]
    fn negative_rate_means_closed() {
        let mut b = TokenBucket::new();
        b.set_rate(-50);
        b.fill();
        assert_eq!(b.max_tokens, 0);
        assert!(!b.consume(1));
    }

    #[test]
    fn lowering_rate_clamps_balance() {
        let mut b = TokenBucket::new();
        b.set_rate(8000);
        b.fill();
        assert_eq!(b.tokens, 100_000);
        b.set_rate(80);
        assert_eq!(b.tokens, 1_000);
    }

    #[test]
    fn refill_and_consume() {
        let mut b = TokenBucket::new();
        b.set_rate(800);
        b.refill();
        assert!(!b.consume(101));
        assert_eq!(b.tokens, 100);
        assert!(b.consume(100));
        assert_eq!(b.tokens, 0);

        for _ in 0..200 {
            b.refill();
        }
        assert_eq!(b.tokens, 10_000);
    }
}
