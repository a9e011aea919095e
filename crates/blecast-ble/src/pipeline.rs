//! Receive pipeline tasks
//!
//! While scanning, two tasks run side by side: one drains the scanner's
//! report stream into [`ScanIngest`], the other sweeps expired entries out of
//! the shared [`ReassemblyBuffer`]. Neither waits on the other; they only meet
//! inside the buffer, which locks per key.
//!
//! Reports are restamped with the pipeline's clock on arrival, so entry ages
//! and sweep deadlines are always measured on the same clock whatever the
//! scanner put in [`ScanEvent::timestamp`](blecast_core::ScanEvent).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use blecast_core::{IngestStats, MessageSink, ReassemblyBuffer, ScanIngest, TimeSource};

use crate::radio::ScanEventStream;

/// Running ingestion and sweep tasks
pub struct ScanPipeline<K: MessageSink + 'static> {
    ingest: Arc<ScanIngest<K>>,
    ingest_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl<K: MessageSink + 'static> ScanPipeline<K> {
    /// Spawn both tasks
    pub fn spawn(
        ingest: ScanIngest<K>,
        events: ScanEventStream,
        sweep_interval: Duration,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let ingest = Arc::new(ingest);
        let ingest_task = tokio::spawn(run_ingest(Arc::clone(&ingest), events, Arc::clone(&clock)));
        let sweep_task = tokio::spawn(run_sweep(
            Arc::clone(ingest.buffer()),
            sweep_interval,
            clock,
        ));
        Self {
            ingest,
            ingest_task,
            sweep_task,
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.ingest.stats()
    }

    /// Abort both tasks and wait for them to finish
    pub async fn shutdown(self) -> IngestStats {
        self.ingest_task.abort();
        self.sweep_task.abort();
        let _ = self.ingest_task.await;
        let _ = self.sweep_task.await;
        self.ingest.stats()
    }
}

async fn run_ingest<K: MessageSink>(
    ingest: Arc<ScanIngest<K>>,
    mut events: ScanEventStream,
    clock: Arc<dyn TimeSource>,
) {
    while let Some(mut event) = events.next().await {
        event.timestamp = clock.now();
        ingest.handle(event);
    }
    info!("Scan event stream ended");
}

async fn run_sweep(buffer: Arc<ReassemblyBuffer>, period: Duration, clock: Arc<dyn TimeSource>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let removed = buffer.sweep(clock.now());
        if removed > 0 {
            debug!("Sweep removed {} expired reassembly entries", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use blecast_core::{
        ChannelId, DeviceAddress, Dispatcher, Fragmenter, MessageId, ObservedMessage, ProtocolConfig,
        ReassemblyConfig, ScanEvent, SystemTimeSource, TEST_COMPANY_ID,
    };
    use tokio::sync::mpsc;

    fn event(channel: ChannelId, data: Vec<u8>, clock: &TokioClock) -> ScanEvent {
        ScanEvent::new(
            channel,
            TEST_COMPANY_ID,
            data,
            DeviceAddress::new([1, 2, 3, 4, 5, 6]),
            -40,
            clock.now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_while_ingesting() {
        let clock = TokioClock::new();
        let config = ReassemblyConfig::default();
        let buffer = Arc::new(ReassemblyBuffer::new(config.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel::<ObservedMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(event_rx, |mut rx| async move {
            rx.recv().await.map(|e| (e, rx))
        })
        .boxed();

        let ingest = ScanIngest::new(ProtocolConfig::default(), Arc::clone(&buffer), Dispatcher::new(tx));
        let pipeline = ScanPipeline::spawn(ingest, stream, config.sweep_interval, Arc::new(clock));

        let channel = ChannelId::generate(0x00);
        let packets = Fragmenter::split(&[5; 20], 10, MessageId::new(1)).unwrap();
        event_tx.send(event(channel, packets[0].to_bytes(), &clock)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(buffer.active_entries(), 1);

        // TTL 10 s, sweep every 5 s: gone by the sweep at 15 s
        tokio::time::sleep(Duration::from_millis(15_100)).await;
        assert_eq!(buffer.active_entries(), 0);

        // The rest of the message arriving late does not complete anything
        for packet in &packets[1..] {
            event_tx.send(event(channel, packet.to_bytes(), &clock)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_err());

        let stats = pipeline.shutdown().await;
        assert_eq!(stats.fragments, packets.len() as u64);
        assert_eq!(stats.reassembled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_age_on_pipeline_clock() {
        let config = ReassemblyConfig::default();
        let buffer = Arc::new(ReassemblyBuffer::new(config.clone()));
        let (tx, _rx) = mpsc::unbounded_channel::<ObservedMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(event_rx, |mut rx| async move {
            rx.recv().await.map(|e| (e, rx))
        })
        .boxed();

        let ingest = ScanIngest::new(ProtocolConfig::default(), Arc::clone(&buffer), Dispatcher::new(tx));
        let pipeline = ScanPipeline::spawn(ingest, stream, config.sweep_interval, Arc::new(TokioClock::new()));

        // Scanner stamps wall-clock time, far ahead of the tokio clock
        let channel = ChannelId::generate(0x00);
        let packets = Fragmenter::split(&[5; 20], 10, MessageId::new(2)).unwrap();
        let mut report = event(channel, packets[0].to_bytes(), &TokioClock::new());
        report.timestamp = SystemTimeSource.now();
        event_tx.send(report).unwrap();

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(buffer.active_entries(), 1);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(buffer.active_entries(), 0);
        assert_eq!(buffer.stats().expired, 1);

        pipeline.shutdown().await;
    }
}
