use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use fingate_sensor::Score;

use crate::error::Error;
use crate::storage::{Attributes, Identity};

/// Indicator state shown to whoever is at the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Positive,
    Negative,
}

/// Everything the gate needs from a human: consent, attribute entry and feedback.
///
/// Prompts may block; they run on the worker thread that owns the capture.
pub trait Operator: Send + Sync {
    fn signal(&self, kind: Feedback, hold_secs: f32);

    /// Ask whether an unknown finger should be enrolled.
    fn confirm_enrollment(&self) -> io::Result<bool>;

    /// Ask for one value per field.
    fn enrollment_attributes(&self, fields: &[String]) -> io::Result<Attributes>;

    fn identity_verified(&self, identity: &Identity, score: Score);

    fn already_enrolled(&self, _id: &str, _score: Score) {}

    fn enrollment_progress(&self, _collected: usize, _required: usize) {}

    fn enrolled(&self, _identity: &Identity) {}

    fn enrollment_failed(&self, _error: &Error) {}
}

/// Operator on the controlling terminal.
pub struct ConsoleOperator<R = io::BufReader<io::Stdin>, W = io::Stdout> {
    input: Mutex<R>,
    output: Mutex<W>,
}

impl ConsoleOperator {
    pub fn stdio() -> Self {
        Self::new(io::BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }

    fn say(&self, message: &str) {
        let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{message}").and_then(|_| out.flush()) {
            log::warn!("console write failed: {}", e);
        }
    }

    fn ask(&self, prompt: &str) -> io::Result<String> {
        {
            let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
            write!(out, "{prompt}")?;
            out.flush()?;
        }
        let mut line = String::new();
        let read = self
            .input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .read_line(&mut line)?;
        if read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "console closed"));
        }
        Ok(line.trim().to_string())
    }
}

impl<R, W> Operator for ConsoleOperator<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn signal(&self, kind: Feedback, hold_secs: f32) {
        let light = match kind {
            Feedback::Positive => "green",
            Feedback::Negative => "red",
        };
        log::info!("indicator: {} ({:.1}s)", light, hold_secs);
    }

    fn confirm_enrollment(&self) -> io::Result<bool> {
        let answer = self.ask("Do you want to register a new user? [y/n]: ")?;
        Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
    }

    fn enrollment_attributes(&self, fields: &[String]) -> io::Result<Attributes> {
        let mut attributes = Attributes::new();
        for field in fields {
            let value = self.ask(&format!("{field}: "))?;
            attributes.insert(field.clone(), value);
        }
        Ok(attributes)
    }

    fn identity_verified(&self, identity: &Identity, score: Score) {
        self.say(&format!("✓ Verified {} (score {})", identity.label(), score));
        for (key, value) in identity.attributes.iter() {
            self.say(&format!("  {key}: {value}"));
        }
    }

    fn already_enrolled(&self, id: &str, score: Score) {
        self.say(&format!("Already enrolled as {id} (score {score})"));
    }

    fn enrollment_progress(&self, collected: usize, required: usize) {
        let left = required.saturating_sub(collected);
        if left > 0 {
            self.say(&format!(
                "Finger {collected} registered successfully! {left} presses left."
            ));
        } else {
            self.say(&format!("Finger {collected} registered successfully!"));
        }
    }

    fn enrolled(&self, identity: &Identity) {
        self.say(&format!("✓ Enrolled {} as {}", identity.label(), identity.id));
    }

    fn enrollment_failed(&self, error: &Error) {
        self.say(&format!("✗ Enrollment failed: {error}"));
    }
}
