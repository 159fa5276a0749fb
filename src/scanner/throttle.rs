//! Makes sure we feed targets to the workers at the correct rate.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

pub struct Throttler {
    max_rate: u64,

    batch_buffer: VecDeque<Batch>,

    /// This is a float so it can be changed more gradually.
    batch_size: f64,

    total_sent: u64,
}

pub struct Batch {
    pub time: Instant,
    pub total_sent_before: u64,
    pub batch_size: u64,
}

impl Throttler {
    pub fn new(max_per_second: u64) -> Self {
        Self {
            max_rate: max_per_second.max(1),
            batch_buffer: VecDeque::new(),
            batch_size: 1.,
            total_sent: 0,
        }
    }

    /// Returns the number of targets that should be sent in the next batch,
    /// sleeping first if we're going faster than the limit.
    ///
    /// Based on masscan's throttler https://github.com/robertdavidgraham/masscan/blob/master/src/main-throttle.c#L59
    pub async fn next_batch(&mut self) -> u64 {
        loop {
            let current_rate = self.estimated_per_second();

            self.batch_buffer.push_back(Batch {
                time: Instant::now(),
                total_sent_before: self.total_sent,
                batch_size: self.batch_size as u64,
            });
            if self.batch_buffer.len() > 256 {
                self.batch_buffer.pop_front();
            }

            if current_rate <= self.max_rate {
                break;
            }

            // if we're above the limit, then wait a bit, lower our batch size, and
            // try again
            let sleep_time = Duration::from_secs_f64(
                ((current_rate - self.max_rate) as f64 / self.max_rate as f64) / 10.,
            )
            // usually happens at the beginning of scans when the rate is overestimated
            .min(Duration::from_millis(100));

            self.batch_size *= 0.999;
            tokio::time::sleep(sleep_time).await;
        }

        self.batch_size = (self.batch_size * 1.005).min(10000.);

        let batch_size = (self.batch_size as u64).max(1);
        self.total_sent += batch_size;

        batch_size
    }

    pub fn estimated_per_second(&self) -> u64 {
        // compare the total_sent_before of the oldest and newest batch
        let (Some(oldest_batch), Some(newest_batch)) =
            (self.batch_buffer.front(), self.batch_buffer.back())
        else {
            return 0;
        };
        if self.batch_buffer.len() < 2 {
            return 0;
        }

        let elapsed = (newest_batch.time - oldest_batch.time).as_secs_f64();
        if elapsed == 0. {
            return 0;
        }

        ((newest_batch.total_sent_before - oldest_batch.total_sent_before) as f64 / elapsed) as u64
    }
}
