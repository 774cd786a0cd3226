#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

use fingate::operator::{Feedback, Operator};
use fingate::storage::{Attributes, Identity, StoreError, TemplateStore};
use fingate::{CancelToken, Capture, Error, Matcher, Score};

/// Templates are `[finger, press]`. Same finger scores 500, different finger 10.
/// A stored template starting with `0xEE` makes the matcher panic.
#[derive(Default)]
pub struct FingerMatcher {
    pub probes: Mutex<Vec<Vec<u8>>>,
    pub merges: AtomicUsize,
    pub empty_merge: bool,
}

impl FingerMatcher {
    pub fn probes(&self) -> Vec<Vec<u8>> {
        self.probes.lock().unwrap().clone()
    }

    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }
}

impl Matcher for FingerMatcher {
    fn compare(&self, a: &[u8], b: &[u8]) -> Option<Score> {
        self.probes.lock().unwrap().push(b.to_vec());
        match (a.first(), b.first()) {
            (Some(0xEE), _) => panic!("sensor library crashed"),
            (Some(x), Some(y)) if x == y => Some(500),
            (Some(_), Some(_)) => Some(10),
            _ => None,
        }
    }

    fn merge(&self, t1: &[u8], _t2: &[u8], _t3: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        if self.empty_merge {
            return Ok(Vec::new());
        }
        Ok(vec![t1[0], 0xAA])
    }
}

/// Blocks inside every comparison until the test releases it.
pub struct GatedMatcher {
    pub entered: Mutex<Sender<Vec<u8>>>,
    pub release: Mutex<Receiver<()>>,
}

impl Matcher for GatedMatcher {
    fn compare(&self, _a: &[u8], b: &[u8]) -> Option<Score> {
        self.entered.lock().unwrap().send(b.to_vec()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        Some(1000)
    }

    fn merge(&self, t1: &[u8], _t2: &[u8], _t3: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(t1.to_vec())
    }
}

/// Operator that answers from a script and records what it was told.
#[derive(Default)]
pub struct Recorder {
    pub consent: bool,
    pub attributes: Attributes,
    pub fail_attributes: bool,
    pub cancel_on_attributes: Option<CancelToken>,
    pub signals: Mutex<Vec<Feedback>>,
    pub consent_asked: AtomicUsize,
    pub verified: Mutex<Vec<String>>,
    pub failures: AtomicUsize,
}

impl Recorder {
    pub fn consenting() -> Self {
        Self {
            consent: true,
            attributes: Attributes::from([("username".to_string(), "ada".to_string())]),
            ..Self::default()
        }
    }

    pub fn signals(&self) -> Vec<Feedback> {
        self.signals.lock().unwrap().clone()
    }

    pub fn last_signal(&self) -> Option<Feedback> {
        self.signals.lock().unwrap().last().copied()
    }
}

impl Operator for Recorder {
    fn signal(&self, kind: Feedback, _hold_secs: f32) {
        self.signals.lock().unwrap().push(kind);
    }

    fn confirm_enrollment(&self) -> io::Result<bool> {
        self.consent_asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.consent)
    }

    fn enrollment_attributes(&self, _fields: &[String]) -> io::Result<Attributes> {
        if let Some(token) = &self.cancel_on_attributes {
            token.cancel();
        }
        if self.fail_attributes {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "console closed"));
        }
        Ok(self.attributes.clone())
    }

    fn identity_verified(&self, identity: &Identity, _score: Score) {
        self.verified.lock().unwrap().push(identity.label().to_string());
    }

    fn enrollment_failed(&self, _error: &Error) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store whose reads or writes always fail.
pub struct BrokenStore {
    pub reads_fail: bool,
}

impl TemplateStore for BrokenStore {
    fn list_all(&self) -> Result<Vec<Identity>, StoreError> {
        if self.reads_fail {
            Err(StoreError::Read("disk unplugged".to_string()))
        } else {
            Ok(Vec::new())
        }
    }

    fn save(&self, _attributes: Attributes, _template: Vec<u8>) -> Result<Identity, StoreError> {
        Err(StoreError::Write("disk full".to_string()))
    }

    fn remove(&self, _id: &str) -> Result<bool, StoreError> {
        Err(StoreError::Write("disk full".to_string()))
    }

    fn purge(&self) -> Result<(), StoreError> {
        Err(StoreError::Write("disk full".to_string()))
    }
}

pub fn capture(template: &[u8]) -> Capture {
    Capture::new(template.to_vec(), None).unwrap()
}

pub fn identity(name: &str, template: &[u8]) -> Identity {
    Identity::new(
        Attributes::from([("username".to_string(), name.to_string())]),
        template.to_vec(),
    )
}
