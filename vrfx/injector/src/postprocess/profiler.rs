use crate::graphics::*;
use log::*;
use std::{thread, time::Duration};
use vrfx_common::*;

const QUERY_COUNT: usize = 6;
const SAMPLES_PER_REPORT: u32 = 500;
const MAX_WAIT_ITERATIONS: u32 = 50;

struct QuerySet<B: Backend> {
    disjoint: B::Query,
    start: B::Query,
    end: B::Query,
    issued: bool,
}

/// GPU time of the post-processing passes, measured with a ring of timestamp queries. Results
/// are read back `QUERY_COUNT` passes late so that the wait for them is normally zero.
pub struct Profiler<B: Backend> {
    queries: Vec<QuerySet<B>>,
    current: usize,
    summed_seconds: f64,
    sample_count: u32,
}

impl<B: Backend> Profiler<B> {
    pub fn new(device: &B::Device) -> StrResult<Self> {
        let mut queries = vec![];
        for _ in 0..QUERY_COUNT {
            queries.push(QuerySet {
                disjoint: device.create_query(QueryKind::TimestampDisjoint)?,
                start: device.create_query(QueryKind::Timestamp)?,
                end: device.create_query(QueryKind::Timestamp)?,
                issued: false,
            });
        }

        Ok(Self {
            queries,
            current: 0,
            summed_seconds: 0.,
            sample_count: 0,
        })
    }

    pub fn begin(&self, context: &B::Context) {
        let set = &self.queries[self.current];
        context.begin_query(&set.disjoint);
        context.end_query(&set.start);
    }

    /// Close the current measurement and consume the oldest one. Returns the average GPU time
    /// per frame in milliseconds whenever a report is due.
    pub fn end(&mut self, context: &B::Context) -> Option<f32> {
        {
            let set = &mut self.queries[self.current];
            context.end_query(&set.end);
            context.end_query(&set.disjoint);
            set.issued = true;
        }

        self.current = (self.current + 1) % QUERY_COUNT;
        let set = &self.queries[self.current];
        if !set.issued {
            return None;
        }

        let mut disjoint = context.timestamp_disjoint(&set.disjoint);
        let mut iterations = 0;
        while disjoint.is_none() && iterations < MAX_WAIT_ITERATIONS {
            thread::sleep(Duration::from_millis(1));
            disjoint = context.timestamp_disjoint(&set.disjoint);
            iterations += 1;
        }

        let disjoint = disjoint.filter(|d| !d.disjoint)?;
        let begin = context.timestamp(&set.start)?;
        let end = context.timestamp(&set.end)?;
        self.summed_seconds += end.saturating_sub(begin) as f64 / disjoint.frequency as f64;
        self.sample_count += 1;

        if self.sample_count < SAMPLES_PER_REPORT {
            return None;
        }

        // passes run once per eye
        let average_ms = (1000. * self.summed_seconds / self.sample_count as f64 * 2.) as f32;
        info!("Average GPU processing time for post-processing: {} ms", average_ms);
        self.summed_seconds = 0.;
        self.sample_count = 0;

        Some(average_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::mock::*;

    #[test]
    fn reports_every_500_samples() {
        let device = MockDevice::new();
        let context = device.immediate_context().unwrap();
        let mut profiler = Profiler::<Mock>::new(&device).unwrap();
        assert_eq!(device.created_count("query"), 3 * QUERY_COUNT);

        let mut reports = vec![];
        for _ in 0..(QUERY_COUNT - 1) + SAMPLES_PER_REPORT as usize {
            profiler.begin(&context);
            if let Some(report) = profiler.end(&context) {
                reports.push(report);
            }
        }

        // every pass spans 1000 ticks at 1 MHz, doubled for both eyes
        assert_eq!(reports.len(), 1);
        assert!((reports[0] - 2.).abs() < 1e-4);
    }
}
