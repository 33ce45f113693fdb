//! Warm-reboot stream delivery: a paced sender and a capture running side
//! by side.
//!
//! The capture must be on the wire before the first packet leaves, so the
//! sender blocks on a start event that is set only after a priming delay.
//! Everything the capture collected is handed to the flow analysis once
//! both tasks are done.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gapwatch_probes::analysis::CapturedPacket;
use gapwatch_probes::dataplane::{Dataplane, DataplaneError};
use gapwatch_probes::stream::StreamPlan;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SendSniffError {
    #[error("capture failed: {0}")]
    Capture(#[from] DataplaneError),
    #[error("capture task panicked")]
    CaptureJoin,
}

/// Extra listen time beyond the nominal window, covering the sender's
/// scheduling jitter and the tail of in-flight packets.
const CAPTURE_SLACK: Duration = Duration::from_secs(30);
/// How long the capture gets to settle before the sender starts.
const PRIMING_DELAY: Duration = Duration::from_secs(2);
/// The sender will not wait for the start event forever.
const START_WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Emit the stream while capturing it; returns the raw capture.
pub async fn send_and_sniff(
    dp: Arc<dyn Dataplane>,
    plan: Arc<StreamPlan>,
    time_to_listen: Duration,
) -> Result<Vec<CapturedPacket>, SendSniffError> {
    let (started_tx, started_rx) = watch::channel(false);

    let capture_dp = dp.clone();
    let capture_task = tokio::spawn(async move {
        let started = Instant::now();
        info!("sniffer started");
        let result = capture_dp.capture_stream(time_to_listen + CAPTURE_SLACK).await;
        info!("sniffer has been running for {:?}", started.elapsed());
        result
    });

    let sender_task = tokio::spawn(run_sender(dp, plan, started_rx));

    tokio::time::sleep(PRIMING_DELAY).await;
    let _ = started_tx.send(true);

    let packets = capture_task
        .await
        .map_err(|_| SendSniffError::CaptureJoin)??;
    let sent = sender_task.await.unwrap_or(0);
    info!(captured = packets.len(), sent, "send-and-sniff finished");
    Ok(packets)
}

async fn run_sender(
    dp: Arc<dyn Dataplane>,
    plan: Arc<StreamPlan>,
    mut started_rx: watch::Receiver<bool>,
) -> usize {
    // Proceed even if the event never fires; a capture that failed to
    // start still leaves the analysis with a usable error.
    let _ = tokio::time::timeout(START_WAIT_LIMIT, started_rx.wait_for(|v| *v)).await;

    let started = Instant::now();
    info!(packets = plan.len(), "sender started");
    let mut sent = 0usize;
    for (port, frame) in &plan.packets {
        tokio::time::sleep(plan.send_interval).await;
        match dp.send_packet(*port, frame).await {
            Ok(()) => sent += 1,
            Err(e) => warn!("stream send failed: {e}"),
        }
    }
    info!("sender has been running for {:?}", started.elapsed());
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapwatch_probes::dataplane::testing::FakeDataplane;

    fn tiny_plan(count: usize) -> StreamPlan {
        StreamPlan {
            packets: (0..count).map(|i| (i as u32 % 4, vec![0u8; 60])).collect(),
            send_interval: Duration::from_micros(3500),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_the_whole_plan_and_returns_the_capture() {
        let dp = Arc::new(FakeDataplane::new(vec![28, 29]));
        dp.set_capture(vec![CapturedPacket {
            time: 1_700_000_000.0,
            data: vec![0u8; 60],
        }]);

        let plan = Arc::new(tiny_plan(250));
        let capture = send_and_sniff(dp.clone(), plan, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(capture.len(), 1);
        assert_eq!(dp.sent_packets(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_plan_still_yields_the_capture() {
        let dp = Arc::new(FakeDataplane::new(vec![28]));
        let plan = Arc::new(tiny_plan(0));
        let capture = send_and_sniff(dp.clone(), plan, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(capture.is_empty());
        assert_eq!(dp.sent_packets(), 0);
    }
}
