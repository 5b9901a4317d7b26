#![forbid(unsafe_code)]

// Message generator - single producer of randomized outbound units

use crate::error::{LoadError, LoadResult};
use crate::message::{MessageKind, OutboundUnit};
use crate::queue::{Envelope, UnitSender};
use chrono::Utc;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Template texts `Message-1` .. `Message-<size>`.
pub fn default_message_pool(size: usize) -> Vec<String> {
    (1..=size).map(|i| format!("Message-{i}")).collect()
}

/// Outcome of a generator run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorReport {
    pub produced: u64,
    /// All consumers went away before generation finished.
    pub interrupted: bool,
}

/// Produces a fixed number of units followed by one sentinel per worker.
pub struct MessageGenerator {
    queue: UnitSender,
    total: u64,
    sentinel_count: usize,
    templates: Arc<[String]>,
    user_ids: RangeInclusive<u32>,
    room_ids: RangeInclusive<u32>,
}

impl MessageGenerator {
    /// # Errors
    /// Returns `Config` if the template pool or an id range is empty.
    pub fn new(
        queue: UnitSender,
        total: u64,
        sentinel_count: usize,
        templates: Vec<String>,
        user_ids: RangeInclusive<u32>,
        room_ids: RangeInclusive<u32>,
    ) -> LoadResult<Self> {
        if templates.is_empty() {
            return Err(LoadError::Config("message pool is empty".to_string()));
        }
        if user_ids.is_empty() {
            return Err(LoadError::Config(format!("empty user id range {user_ids:?}")));
        }
        if room_ids.is_empty() {
            return Err(LoadError::Config(format!("empty room id range {room_ids:?}")));
        }
        Ok(Self {
            queue,
            total,
            sentinel_count,
            templates: templates.into(),
            user_ids,
            room_ids,
        })
    }

    /// Runs the generator on a dedicated `message-generator` thread.
    pub fn spawn(self) -> LoadResult<JoinHandle<GeneratorReport>> {
        let handle = std::thread::Builder::new()
            .name("message-generator".to_string())
            .spawn(move || self.run(&mut rand::thread_rng()))?;
        Ok(handle)
    }

    /// Enqueues every unit and then the sentinels, blocking while the queue is full.
    ///
    /// Stops early, without error, once every receiver has been dropped.
    pub fn run<R: Rng + ?Sized>(self, rng: &mut R) -> GeneratorReport {
        for seq_id in 0..self.total {
            let unit = self.generate_one(rng, seq_id);
            if self.queue.send(Envelope::Unit(unit)).is_err() {
                warn!("Generator interrupted after {} of {} units", seq_id, self.total);
                return GeneratorReport {
                    produced: seq_id,
                    interrupted: true,
                };
            }
        }

        for _ in 0..self.sentinel_count {
            if self.queue.send(Envelope::Stop).is_err() {
                break;
            }
        }

        info!("Generator finished: {} units, {} sentinels", self.total, self.sentinel_count);
        GeneratorReport {
            produced: self.total,
            interrupted: false,
        }
    }

    fn generate_one<R: Rng + ?Sized>(&self, rng: &mut R, seq_id: u64) -> OutboundUnit {
        let user_id = rng.gen_range(self.user_ids.clone());
        let room_id = rng.gen_range(self.room_ids.clone());
        let text = &self.templates[rng.gen_range(0..self.templates.len())];
        let kind = MessageKind::sample(rng);

        OutboundUnit::new(seq_id, user_id, format!("user{user_id}"), text.as_str(), room_id, kind, Utc::now())
    }
}
