//! Capture-processing coordinator.
//!
//! At most one capture is processed at a time. A capture offered while another
//! is in flight is dropped. In enrollment mode the coordinator owns the single
//! [`EnrollmentSession`]; only a complete three-sample merge ever reaches the
//! template store.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use fingate_sensor::{Capture, Matcher, Score};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::matcher::{self, MatchPolicy, MatchResult};
use crate::operator::{Feedback, Operator};
use crate::session::{Accumulate, EnrollmentSession, REQUIRED_SAMPLES};
use crate::storage::{Identity, TemplateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Verify,
    Enroll,
}

/// Thresholds and policies the coordinator runs with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub acceptance_threshold: Score,
    pub identify_threshold: Score,
    pub same_finger_threshold: Score,
    pub policy: MatchPolicy,
    pub feedback_hold_secs: f32,
    pub attribute_fields: Vec<String>,
    pub debug_image_dir: Option<PathBuf>,
}

impl From<&Config> for Settings {
    fn from(cfg: &Config) -> Self {
        Self {
            acceptance_threshold: cfg.acceptance_threshold,
            identify_threshold: cfg.identify_threshold,
            same_finger_threshold: cfg.same_finger_threshold,
            policy: cfg.match_policy,
            feedback_hold_secs: cfg.feedback_hold_secs,
            attribute_fields: cfg.attribute_fields.clone(),
            debug_image_dir: cfg.debug_image_dir.clone(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Shared cancellation flag, set from a signal handler or the owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How one admitted capture ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted { identity: Identity, score: Score },
    Rejected,
    AlreadyEnrolled { id: String, score: Score },
    /// The operator did not want to enroll the unknown finger.
    Declined,
    SampleAccepted { collected: usize, required: usize },
    SampleMismatch { collected: usize, score: Option<Score> },
    Enrolled(Identity),
    EnrollmentFailed,
    Cancelled,
    /// An unexpected failure inside the unit of work. The session was cleared.
    Aborted,
}

struct Shared<M, S, O> {
    mode: Mode,
    matcher: M,
    store: S,
    operator: O,
    settings: Settings,
    cancel: CancelToken,
    busy: AtomicBool,
    session: Mutex<EnrollmentSession>,
    sequence: AtomicU64,
}

/// Clears the busy flag when the unit of work ends, however it ends.
struct BusyGuard<M, S, O>(Arc<Shared<M, S, O>>);

impl<M, S, O> Drop for BusyGuard<M, S, O> {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

pub struct Coordinator<M, S, O> {
    shared: Arc<Shared<M, S, O>>,
}

impl<M, S, O> Clone for Coordinator<M, S, O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M, S, O> Coordinator<M, S, O>
where
    M: Matcher + 'static,
    S: TemplateStore + 'static,
    O: Operator + 'static,
{
    pub fn new(
        mode: Mode,
        matcher: M,
        store: S,
        operator: O,
        settings: Settings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                matcher,
                store,
                operator,
                settings,
                cancel,
                busy: AtomicBool::new(false),
                session: Mutex::new(EnrollmentSession::default()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    pub fn matcher(&self) -> &M {
        &self.shared.matcher
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    pub fn operator(&self) -> &O {
        &self.shared.operator
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.shared.cancel
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Samples held by the current enrollment, `0` when none is active.
    pub fn enrollment_samples(&self) -> usize {
        self.shared.lock_session().collected()
    }

    fn admit(&self) -> Option<BusyGuard<M, S, O>> {
        self.shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(Arc::clone(&self.shared)))
    }

    /// Admit `capture` and process it on a new worker thread.
    ///
    /// Returns `None` when a previous capture is still in flight; the capture is dropped.
    pub fn on_capture(&self, capture: Capture) -> Option<JoinHandle<Outcome>> {
        let Some(guard) = self.admit() else {
            log::debug!("capture dropped: previous capture still in flight");
            return None;
        };
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("fingate-capture".to_string())
            .spawn(move || {
                let _guard = guard;
                shared.run_unit(capture)
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                // the closure (and with it the guard) was dropped, so the gate is open again
                log::error!("failed to spawn capture worker: {}", e);
                None
            }
        }
    }

    /// Admit `capture` and process it on the calling thread.
    pub fn handle(&self, capture: Capture) -> Option<Outcome> {
        let Some(_guard) = self.admit() else {
            log::debug!("capture dropped: previous capture still in flight");
            return None;
        };
        Some(self.shared.run_unit(capture))
    }

    /// Throw away any in-progress enrollment without persisting it.
    pub fn discard_session(&self) {
        let mut session = self.shared.lock_session();
        if session.is_active() {
            log::info!(
                "discarding enrollment with {}/{} samples",
                session.collected(),
                REQUIRED_SAMPLES
            );
        }
        session.clear();
    }
}

impl<M, S, O> Shared<M, S, O>
where
    M: Matcher,
    S: TemplateStore,
    O: Operator,
{
    fn lock_session(&self) -> MutexGuard<'_, EnrollmentSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self, kind: Feedback) {
        self.operator.signal(kind, self.settings.feedback_hold_secs);
    }

    /// Unit-of-work boundary: nothing that happens inside escapes as a panic or error.
    fn run_unit(&self, capture: Capture) -> Outcome {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.process(seq, capture)));
        match result {
            Ok(Ok(outcome)) => {
                log::debug!("capture #{} finished: {:?}", seq, outcome);
                outcome
            }
            Ok(Err(e)) => {
                log::error!("capture #{} failed: {}", seq, e);
                self.lock_session().clear();
                Outcome::Aborted
            }
            Err(_) => {
                log::error!("capture #{} panicked", seq);
                self.lock_session().clear();
                Outcome::Aborted
            }
        }
    }

    fn process(&self, seq: u64, capture: Capture) -> Result<Outcome> {
        if self.cancel.is_cancelled() {
            self.lock_session().clear();
            return Ok(Outcome::Cancelled);
        }
        self.dump_image(seq, &capture);
        match self.mode {
            Mode::Verify => Ok(self.verify(capture.template())),
            Mode::Enroll => self.enroll(capture.into_template()),
        }
    }

    fn dump_image(&self, seq: u64, capture: &Capture) {
        let Some(dir) = &self.settings.debug_image_dir else {
            return;
        };
        let path = dir.join(format!("capture-{seq:06}.png"));
        match capture.save_image(&path) {
            Ok(true) => log::debug!("capture image written to {}", path.display()),
            Ok(false) => {}
            Err(e) => log::warn!("could not write capture image: {:#}", e),
        }
    }

    fn gallery(&self) -> Vec<Identity> {
        match self.store.list_all() {
            Ok(gallery) => gallery,
            Err(e) => {
                log::error!("{}; treating gallery as empty", e);
                Vec::new()
            }
        }
    }

    fn verify(&self, probe: &[u8]) -> Outcome {
        let gallery = self.gallery();
        if gallery.is_empty() {
            log::info!("no enrolled identities");
        }
        let result = matcher::verify(
            &self.matcher,
            gallery,
            probe,
            self.settings.acceptance_threshold,
            self.settings.policy,
        );
        match result {
            MatchResult::Verified { identity, score } => {
                log::info!("{} verified with score {}", identity.label(), score);
                self.signal(Feedback::Positive);
                self.operator.identity_verified(&identity, score);
                Outcome::Accepted { identity, score }
            }
            _ => {
                log::info!("no matching fingerprint found");
                self.signal(Feedback::Negative);
                Outcome::Rejected
            }
        }
    }

    fn enroll(&self, template: Vec<u8>) -> Result<Outcome> {
        let mut session = self.lock_session();

        if !session.is_active() {
            let gallery = self.gallery();
            let found = matcher::identify(
                &self.matcher,
                &gallery,
                &template,
                self.settings.identify_threshold,
            );
            if let MatchResult::Identified { id, score } = found {
                log::info!("successfully identified {}, score {}", id, score);
                self.signal(Feedback::Positive);
                self.operator.already_enrolled(&id, score);
                return Ok(Outcome::AlreadyEnrolled { id, score });
            }
            if !self.operator.confirm_enrollment()? {
                log::info!("enrollment declined");
                return Ok(Outcome::Declined);
            }
            if self.cancel.is_cancelled() {
                log::info!("enrollment interrupted before it started");
                return Ok(Outcome::Cancelled);
            }
            session.begin(template);
            log::info!("enrollment started: 1/{}", REQUIRED_SAMPLES);
            self.signal(Feedback::Positive);
            self.operator.enrollment_progress(1, REQUIRED_SAMPLES);
            return Ok(Outcome::SampleAccepted {
                collected: 1,
                required: REQUIRED_SAMPLES,
            });
        }

        match session.offer(&self.matcher, template, self.settings.same_finger_threshold) {
            Accumulate::Accepted { collected } => {
                log::info!("enrollment sample {}/{} accepted", collected, REQUIRED_SAMPLES);
                self.signal(Feedback::Positive);
                self.operator.enrollment_progress(collected, REQUIRED_SAMPLES);
                if collected < REQUIRED_SAMPLES {
                    return Ok(Outcome::SampleAccepted {
                        collected,
                        required: REQUIRED_SAMPLES,
                    });
                }
            }
            Accumulate::Mismatch { collected, score } => {
                log::warn!(
                    "different finger (score {:?}), please present the original finger",
                    score
                );
                self.signal(Feedback::Negative);
                return Ok(Outcome::SampleMismatch { collected, score });
            }
            Accumulate::Full => {}
        }

        let outcome = self.complete(&session);
        session.clear();
        outcome
    }

    /// Merge the three samples and persist the new identity. The caller clears the session.
    fn complete(&self, session: &EnrollmentSession) -> Result<Outcome> {
        let [t1, t2, t3] = session
            .samples()
            .ok_or_else(|| Error::MalformedTemplate("enrollment is missing samples".to_string()))?;

        let merged = match self.matcher.merge(t1, t2, t3) {
            Ok(merged) if !merged.is_empty() => merged,
            Ok(_) => {
                let error = Error::MalformedTemplate("merge produced an empty template".to_string());
                return Ok(self.fail(error));
            }
            Err(e) => return Ok(self.fail(Error::MalformedTemplate(format!("{e:#}")))),
        };

        let attributes = self.operator.enrollment_attributes(&self.settings.attribute_fields)?;

        if self.cancel.is_cancelled() {
            log::info!("enrollment interrupted before saving");
            return Ok(Outcome::Cancelled);
        }

        match self.store.save(attributes, merged) {
            Ok(identity) => {
                log::info!("fingerprint template saved for {}", identity.label());
                self.signal(Feedback::Positive);
                self.operator.enrolled(&identity);
                Ok(Outcome::Enrolled(identity))
            }
            Err(e) => Ok(self.fail(e.into())),
        }
    }

    fn fail(&self, error: Error) -> Outcome {
        log::error!("enrollment failed: {}", error);
        self.signal(Feedback::Negative);
        self.operator.enrollment_failed(&error);
        Outcome::EnrollmentFailed
    }
}
