//! In-memory one-way link with fixed latency and random packet loss.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

pub struct LossyLink {
    latency_ms: f64,
    loss: f64,
    rng: Xoshiro256StarStar,
    in_flight: VecDeque<(f64, Vec<u8>)>,
    pub sent: u64,
    pub dropped: u64,
}

impl LossyLink {
    /// `loss` is clamped to `[0, 1]`. The same seed drops the same packets.
    pub fn new(latency_ms: u32, loss: f32, seed: u64) -> Self {
        Self {
            latency_ms: f64::from(latency_ms),
            loss: f64::from(loss.clamp(0.0, 1.0)),
            rng: Xoshiro256StarStar::seed_from_u64(seed),
            in_flight: VecDeque::new(),
            sent: 0,
            dropped: 0,
        }
    }

    pub fn send(&mut self, now_ms: f64, packet: Vec<u8>) {
        self.sent += 1;
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            self.dropped += 1;
            return;
        }
        self.in_flight.push_back((now_ms + self.latency_ms, packet));
    }

    /// Packets whose delivery time has passed, in send order.
    pub fn receive(&mut self, now_ms: f64) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        while let Some((at, _)) = self.in_flight.front() {
            if *at > now_ms {
                break;
            }
            if let Some((_, packet)) = self.in_flight.pop_front() {
                delivered.push(packet);
            }
        }
        delivered
    }
}
