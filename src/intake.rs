//! Scripted survey intake.
//!
//! A [`ResponseCollector`] runs one session for one identity: it verifies the
//! identity, asks every prompt of the [`IntakeScript`] in order, and submits
//! the full answer list exactly once. Partial sessions are never submitted.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::models::SurveyResponse;
use crate::prompts;
use crate::remote::{IdentityService, RemoteError, SubmissionService};

pub const DEFAULT_ALLOWED_DOMAINS: [&str; 4] =
    ["gmail.com", "outlook.com", "hotmail.com", "upc.edu.pe"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeState {
    Idle,
    Verifying,
    AwaitingAnswer(usize),
    Submitting,
    Finished,
    Errored,
    Rejected,
    Abandoned,
}

impl IntakeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Errored | Self::Rejected | Self::Abandoned
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("answer is empty")]
    EmptyAnswer,

    #[error("{0:?} is not an accepted email address")]
    InvalidIdentity(String),

    #[error("{0:?} is not a registered user")]
    UnknownIdentity(String),

    #[error("remote service failed: {0}")]
    Transport(#[source] RemoteError),

    #[error("session already ended ({0:?})")]
    Closed(IntakeState),

    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: IntakeState,
    },

    #[error("intake script has no prompts")]
    EmptyScript,
}

impl IntakeError {
    /// Errors the user can fix in place.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::EmptyAnswer | Self::InvalidIdentity(_))
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::EmptyAnswer => prompts::EMPTY_ANSWER_MESSAGE,
            Self::InvalidIdentity(_) => prompts::INVALID_EMAIL_MESSAGE,
            Self::UnknownIdentity(_) => prompts::UNKNOWN_EMAIL_MESSAGE,
            _ => prompts::SUBMISSION_FAILED_MESSAGE,
        }
    }
}

/// Fixed, ordered list of prompts. Its length is the number of answers a
/// session must collect before it can submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeScript {
    prompts: Vec<String>,
}

impl IntakeScript {
    pub fn new(prompts: Vec<String>) -> Result<Self, IntakeError> {
        if prompts.is_empty() {
            return Err(IntakeError::EmptyScript);
        }
        Ok(Self { prompts })
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn prompt(&self, index: usize) -> Option<&str> {
        self.prompts.get(index).map(String::as_str)
    }
}

impl Default for IntakeScript {
    fn default() -> Self {
        Self {
            prompts: prompts::default_script(),
        }
    }
}

static DEFAULT_IDENTITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    identity_pattern(&DEFAULT_ALLOWED_DOMAINS).expect("default identity pattern compiles")
});

fn identity_pattern<S: AsRef<str>>(domains: &[S]) -> Result<Regex, regex::Error> {
    let alternatives = domains
        .iter()
        .map(|d| regex::escape(d.as_ref()))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"^[^@\s]+@({alternatives})$"))
}

/// Syntactic email check restricted to an allow-list of domains.
#[derive(Debug, Clone)]
pub struct IdentityPolicy {
    pattern: Regex,
}

impl IdentityPolicy {
    pub fn from_domains<S: AsRef<str>>(domains: &[S]) -> anyhow::Result<Self> {
        if domains.is_empty() {
            anyhow::bail!("identity policy needs at least one allowed domain");
        }
        Ok(Self {
            pattern: identity_pattern(domains)?,
        })
    }

    pub fn accepts(&self, email: &str) -> bool {
        self.pattern.is_match(email)
    }
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_IDENTITY_PATTERN.clone(),
        }
    }
}

/// Transitions published to subscribers (the chat view, the CLI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeEvent {
    Prompted {
        index: usize,
        total: usize,
        prompt: String,
    },
    Answered {
        index: usize,
    },
    AnswerRejected,
    Submitting,
    Finished {
        message: String,
    },
    Errored {
        message: String,
    },
    Rejected {
        message: String,
    },
    Abandoned,
}

/// Outcome of an accepted answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Next { index: usize, prompt: String },
    Finished,
}

pub struct ResponseCollector {
    script: IntakeScript,
    policy: IdentityPolicy,
    identity: Arc<dyn IdentityService>,
    submitter: Arc<dyn SubmissionService>,
    state: IntakeState,
    email: Option<String>,
    responses: Vec<SurveyResponse>,
    events: broadcast::Sender<IntakeEvent>,
}

impl ResponseCollector {
    pub fn new(
        script: IntakeScript,
        policy: IdentityPolicy,
        identity: Arc<dyn IdentityService>,
        submitter: Arc<dyn SubmissionService>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            script,
            policy,
            identity,
            submitter,
            state: IntakeState::Idle,
            email: None,
            responses: Vec::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntakeEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> IntakeState {
        self.state
    }

    pub fn script(&self) -> &IntakeScript {
        &self.script
    }

    /// Answers collected so far in this session.
    pub fn responses(&self) -> &[SurveyResponse] {
        &self.responses
    }

    pub fn current_prompt(&self) -> Option<&str> {
        match self.state {
            IntakeState::AwaitingAnswer(i) => self.script.prompt(i),
            _ => None,
        }
    }

    /// False once the session is busy submitting or over.
    pub fn accepts_input(&self) -> bool {
        matches!(self.state, IntakeState::AwaitingAnswer(_))
    }

    fn transition(&mut self, next: IntakeState) {
        debug!("Intake transition - from={:?}, to={:?}", self.state, next);
        self.state = next;
    }

    fn emit(&self, event: IntakeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn reject(&mut self, message: &str) {
        self.transition(IntakeState::Rejected);
        self.emit(IntakeEvent::Rejected {
            message: message.to_string(),
        });
    }

    fn ask(&mut self, index: usize) -> Result<String, IntakeError> {
        let prompt = self
            .script
            .prompt(index)
            .ok_or(IntakeError::InvalidState {
                action: "ask",
                state: self.state,
            })?
            .to_string();
        self.transition(IntakeState::AwaitingAnswer(index));
        self.emit(IntakeEvent::Prompted {
            index,
            total: self.script.len(),
            prompt: prompt.clone(),
        });
        Ok(prompt)
    }

    /// Verify `email` and present the first prompt.
    ///
    /// Any failure ends the session in `Rejected` without asking anything.
    pub async fn start(&mut self, email: &str) -> Result<String, IntakeError> {
        match self.state {
            IntakeState::Idle => {}
            s if s.is_terminal() => return Err(IntakeError::Closed(s)),
            s => {
                return Err(IntakeError::InvalidState {
                    action: "start",
                    state: s,
                })
            }
        }

        if !self.policy.accepts(email) {
            warn!("Intake rejected - reason=malformed identity, email={}", email);
            self.reject(prompts::INVALID_EMAIL_MESSAGE);
            return Err(IntakeError::InvalidIdentity(email.to_string()));
        }

        self.transition(IntakeState::Verifying);
        match self.identity.check_identity(email).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Intake rejected - reason=unknown identity, email={}", email);
                self.reject(prompts::UNKNOWN_EMAIL_MESSAGE);
                return Err(IntakeError::UnknownIdentity(email.to_string()));
            }
            Err(e) => {
                warn!("Intake rejected - reason=identity check failed, error={}", e);
                self.reject(prompts::SUBMISSION_FAILED_MESSAGE);
                return Err(IntakeError::Transport(e));
            }
        }

        info!("Intake session started - email={}, prompts={}", email, self.script.len());
        self.email = Some(email.to_string());
        self.responses = Vec::with_capacity(self.script.len());
        self.ask(0)
    }

    /// Record an answer for the current prompt.
    ///
    /// Blank answers are refused without moving on. The answer to the last
    /// prompt triggers submission before this returns.
    pub async fn submit_answer(&mut self, text: &str) -> Result<Step, IntakeError> {
        let index = match self.state {
            IntakeState::AwaitingAnswer(i) => i,
            s if s.is_terminal() => return Err(IntakeError::Closed(s)),
            s => {
                return Err(IntakeError::InvalidState {
                    action: "answer",
                    state: s,
                })
            }
        };

        let answer = text.trim();
        if answer.is_empty() {
            self.emit(IntakeEvent::AnswerRejected);
            return Err(IntakeError::EmptyAnswer);
        }

        let prompt = self
            .script
            .prompt(index)
            .ok_or(IntakeError::InvalidState {
                action: "answer",
                state: self.state,
            })?
            .to_string();
        self.responses.push(SurveyResponse {
            prompt,
            answer: answer.to_string(),
        });
        self.emit(IntakeEvent::Answered { index });
        debug!("Answer recorded - index={}, length={}", index, answer.len());

        let next = index + 1;
        if next < self.script.len() {
            let prompt = self.ask(next)?;
            return Ok(Step::Next {
                index: next,
                prompt,
            });
        }
        self.send().await
    }

    async fn send(&mut self) -> Result<Step, IntakeError> {
        let email = match (&self.email, self.responses.len() == self.script.len()) {
            (Some(e), true) => e.clone(),
            _ => {
                return Err(IntakeError::InvalidState {
                    action: "submit",
                    state: self.state,
                })
            }
        };

        self.transition(IntakeState::Submitting);
        self.emit(IntakeEvent::Submitting);
        let start = std::time::Instant::now();

        let result = self.submitter.submit(&email, &self.responses).await;
        self.responses.clear();

        match result {
            Ok(()) => {
                info!(
                    "Intake submitted - email={}, answers={}, duration={:.2}s",
                    email,
                    self.script.len(),
                    start.elapsed().as_secs_f32()
                );
                self.transition(IntakeState::Finished);
                self.emit(IntakeEvent::Finished {
                    message: prompts::CLOSING_MESSAGE.to_string(),
                });
                Ok(Step::Finished)
            }
            Err(e) => {
                error!("Intake submission failed - email={}, error={}", email, e);
                self.transition(IntakeState::Errored);
                self.emit(IntakeEvent::Errored {
                    message: prompts::SUBMISSION_FAILED_MESSAGE.to_string(),
                });
                Err(IntakeError::Transport(e))
            }
        }
    }

    /// Leave the session. Collected answers are dropped unsent.
    pub fn abandon(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        info!(
            "Intake abandoned - answered={}/{}",
            self.responses.len(),
            self.script.len()
        );
        self.responses.clear();
        self.transition(IntakeState::Abandoned);
        self.emit(IntakeEvent::Abandoned);
    }
}

impl Drop for ResponseCollector {
    fn drop(&mut self) {
        self.abandon();
    }
}
