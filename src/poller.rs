use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fingate_sensor::{CaptureSource, Matcher};

use crate::coordinator::{CancelToken, Coordinator, Outcome};
use crate::error::{Error, Result};
use crate::operator::Operator;
use crate::storage::TemplateStore;

/// Counters reported when the loop stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub admitted: u64,
    pub dropped: u64,
}

/// How long shutdown waits for an in-flight capture before leaving it detached.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Poll `source` every `interval` and hand captures to `coordinator` until
/// `cancel` is set or the device fails.
///
/// On exit the device is released first. The in-flight capture then gets
/// [`SHUTDOWN_GRACE`] to finish, after which any partial enrollment is
/// discarded. A worker still blocked on an operator prompt is left detached;
/// it owns the session and sees the cancellation before anything is saved.
pub fn run<C, M, S, O>(
    source: &mut C,
    coordinator: &Coordinator<M, S, O>,
    cancel: &CancelToken,
    interval: Duration,
) -> Result<PollStats>
where
    C: CaptureSource + ?Sized,
    M: Matcher + 'static,
    S: TemplateStore + 'static,
    O: Operator + 'static,
{
    let mut stats = PollStats::default();
    let mut in_flight: Option<JoinHandle<Outcome>> = None;

    let result = loop {
        if cancel.is_cancelled() {
            log::info!("shutting down...");
            break Ok(());
        }
        match source.acquire() {
            Ok(Some(capture)) => match coordinator.on_capture(capture) {
                Some(handle) => {
                    stats.admitted += 1;
                    // the previous worker released the gate, so it has finished
                    if let Some(done) = in_flight.replace(handle) {
                        join(done);
                    }
                }
                None => stats.dropped += 1,
            },
            Ok(None) => {}
            Err(e) => break Err(Error::Device(e)),
        }
        std::thread::sleep(interval);
    };

    source.terminate();
    let settled = in_flight.take().map_or(true, |handle| settle(handle, SHUTDOWN_GRACE));
    if settled {
        coordinator.discard_session();
    } else {
        log::warn!("capture worker still waiting on the operator; leaving it detached");
    }
    log::info!(
        "capture loop stopped: {} admitted, {} dropped",
        stats.admitted,
        stats.dropped
    );
    result.map(|_| stats)
}

/// Join `handle` if it finishes within `grace`. Returns `false` if it did not.
fn settle(handle: JoinHandle<Outcome>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    join(handle);
    true
}

fn join(handle: JoinHandle<Outcome>) {
    if handle.join().is_err() {
        log::error!("capture worker terminated abnormally");
    }
}
