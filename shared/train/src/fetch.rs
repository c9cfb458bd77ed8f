use anyhow::Result;
use covalent_data_provider::{AssembledBatch, BatchAssembler, BatchPlan};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, trace};

/// Feeds assembled batches for one epoch through a bounded prefetch queue.
/// Assembly runs ahead of the training step by up to `buffer_size` batches.
pub struct DataFetcher {
    assembler: Arc<Mutex<Box<dyn BatchAssembler>>>,
    active_fetch_task: Option<JoinHandle<()>>,
    buffer_size: usize,
}

pub struct EpochBatches {
    pub num_batches: usize,
    pub next_batch: mpsc::Receiver<Result<AssembledBatch>>,
}

impl DataFetcher {
    pub fn new(assembler: Box<dyn BatchAssembler>, buffer_size: usize) -> Self {
        Self {
            assembler: Arc::new(Mutex::new(assembler)),
            active_fetch_task: None,
            buffer_size,
        }
    }

    /// Starts assembling the plan's batches in order. An assembly failure
    /// is forwarded once and ends the stream: a bad batch is a
    /// configuration or data mismatch, never retried.
    pub fn fetch_epoch(&mut self, plan: BatchPlan) -> EpochBatches {
        let (tx_next_batch, next_batch) = mpsc::channel(self.buffer_size);
        let num_batches = plan.len();

        if let Some(task) = self.active_fetch_task.take() {
            // the previous epoch's tail, if any; nobody is listening anymore
            task.abort();
        }

        let assembler = self.assembler.clone();
        self.active_fetch_task = Some(tokio::spawn(async move {
            trace!(num_batches, "assembly task started");
            for ids in plan.into_batches() {
                let result = assembler.lock().await.assemble(&ids).await;
                let failed = result.is_err();
                if tx_next_batch.send(result).await.is_err() {
                    debug!("batch consumer dropped, stopping assembly");
                    return;
                }
                if failed {
                    return;
                }
            }
            trace!("assembly task drained the plan");
        }));

        EpochBatches {
            num_batches,
            next_batch,
        }
    }
}

impl Drop for DataFetcher {
    fn drop(&mut self) {
        if let Some(task) = self.active_fetch_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::Shuffle;
    use covalent_data_provider::{
        BatchSampler, SamplerConfig, SizeIndex, SyntheticAssembler, synthetic_records,
    };

    fn plan(num_records: usize) -> (BatchPlan, Box<dyn BatchAssembler>) {
        let records = synthetic_records(num_records, 3, 6, 9);
        let index = SizeIndex::build(&records).unwrap();
        let sampler = BatchSampler::new(SamplerConfig {
            batch_size: 4,
            ..Default::default()
        })
        .unwrap();
        let plan = sampler.plan(&index, Shuffle::DontShuffle).unwrap();
        (plan, Box::new(SyntheticAssembler::new(&records)))
    }

    #[tokio::test]
    async fn streams_every_batch_in_plan_order() {
        let (plan, assembler) = plan(17);
        let expected: Vec<Vec<_>> = plan.batches().to_vec();

        let mut fetcher = DataFetcher::new(assembler, 2);
        let mut stream = fetcher.fetch_epoch(plan);
        assert_eq!(stream.num_batches, expected.len());

        let mut seen = Vec::new();
        while let Some(batch) = stream.next_batch.recv().await {
            seen.push(batch.unwrap().ids);
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn assembly_error_ends_the_stream() {
        let records = synthetic_records(4, 3, 6, 9);
        let assembler = Box::new(SyntheticAssembler::new(&records));
        // build a plan referencing an id the assembler doesn't know
        let bogus = synthetic_records(8, 3, 6, 9);
        let index = SizeIndex::build(&bogus).unwrap();
        let sampler = BatchSampler::new(SamplerConfig {
            batch_size: 2,
            ..Default::default()
        })
        .unwrap();
        let plan = sampler.plan(&index, Shuffle::DontShuffle).unwrap();

        let mut fetcher = DataFetcher::new(assembler, 2);
        let mut stream = fetcher.fetch_epoch(plan);
        let mut saw_error = false;
        while let Some(batch) = stream.next_batch.recv().await {
            if batch.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error, "unknown ids should surface as an error");
    }

    #[tokio::test]
    async fn fetcher_can_serve_consecutive_epochs() {
        let (first, assembler) = plan(10);
        let second = first.clone();

        let mut fetcher = DataFetcher::new(assembler, 2);
        for plan in [first, second] {
            let mut stream = fetcher.fetch_epoch(plan);
            let mut count = 0;
            while let Some(batch) = stream.next_batch.recv().await {
                batch.unwrap();
                count += 1;
            }
            assert_eq!(count, stream.num_batches);
        }
    }
}
