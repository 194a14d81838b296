//! Biometric gate: a bounded, cancellable user-presence check.
//!
//! The native prompt APIs are callback based. A [`Presenter`] shows the
//! prompt and later answers through a one-shot [`PromptResponder`]. The
//! gate waits for that answer on its own small runtime, racing it against
//! the timeout and a [`CancellationToken`]. Whichever wins, the prompt is
//! either answered or dismissed through its [`PromptHandle`] before
//! `authenticate` returns, so nothing is left on screen.
//!
//! ```text
//! Idle ──present──▶ Presenting ──▶ Approved | Denied | Cancelled | TimedOut | Unavailable
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use coffre_crypto_core::SecretBuffer;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};

use crate::backend::BackendError;
use crate::error::VaultError;

/// Upper bound on a single prompt, matching the native prompt semaphores.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Status and outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvailabilityStatus {
    Available,
    NotEnrolled,
    HardwareUnavailable,
    LockedOut,
}

impl fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Available => "available",
            Self::NotEnrolled => "no biometrics enrolled",
            Self::HardwareUnavailable => "biometric hardware unavailable",
            Self::LockedOut => "biometrics locked out",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BiometricKind {
    TouchId,
    FaceId,
    OpticId,
    Fingerprint,
    Face,
    Iris,
}

/// What to show in the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub title: String,
    /// Label of the fallback button (e.g. "Use passcode").
    pub fallback_title: Option<String>,
    pub allow_device_credential: bool,
    /// Require an explicit confirm tap after a passive (face) match.
    pub require_explicit_confirmation: bool,
    /// Ask for an application password instead of a biometric.
    pub capture_password: bool,
}

impl PromptRequest {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fallback_title: None,
            allow_device_credential: false,
            require_explicit_confirmation: true,
            capture_password: false,
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback_title = Some(fallback.into());
        self
    }

    #[must_use]
    pub const fn allow_device_credential(mut self, allow: bool) -> Self {
        self.allow_device_credential = allow;
        self
    }

    #[must_use]
    pub const fn require_explicit_confirmation(mut self, require: bool) -> Self {
        self.require_explicit_confirmation = require;
        self
    }

    #[must_use]
    pub const fn capture_password(mut self, capture: bool) -> Self {
        self.capture_password = capture;
        self
    }
}

/// Opaque proof of a successful prompt.
///
/// Carries whatever the platform hands back: an authenticated crypto-object
/// handle, an `LAContext` reference, or the captured application password.
pub struct AuthToken(SecretBuffer);

impl AuthToken {
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        Self(SecretBuffer::from_vec(bytes.to_vec()))
    }

    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.0.expose()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// The presenter's answer.
#[derive(Debug)]
pub enum PromptOutcome {
    Approved(Option<AuthToken>),
    /// Wrong biometric or credential.
    Denied,
    /// User, fallback button or system dismissed the prompt.
    Cancelled,
    /// Hardware went away or locked out while presenting.
    Unavailable,
}

/// Result of [`BiometricGate::authenticate`].
#[derive(Debug)]
pub enum AuthResult {
    Approved(Option<AuthToken>),
    Denied,
    Cancelled,
    TimedOut,
    Unavailable,
}

impl AuthResult {
    #[must_use]
    pub const fn state(&self) -> GateState {
        match self {
            Self::Approved(_) => GateState::Approved,
            Self::Denied => GateState::Denied,
            Self::Cancelled => GateState::Cancelled,
            Self::TimedOut => GateState::TimedOut,
            Self::Unavailable => GateState::Unavailable,
        }
    }

    /// Convert to the token on approval, or the matching vault error.
    ///
    /// # Errors
    ///
    /// Every non-approved outcome maps to its own authentication error.
    pub fn into_token(self) -> Result<Option<AuthToken>, VaultError> {
        match self {
            Self::Approved(token) => Ok(token),
            Self::Denied => Err(VaultError::AuthenticationFailed),
            Self::Cancelled => Err(VaultError::AuthenticationCancelled),
            Self::TimedOut => Err(VaultError::AuthenticationTimedOut),
            Self::Unavailable => Err(VaultError::GateUnavailable(
                AvailabilityStatus::HardwareUnavailable,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateState {
    Idle,
    Presenting,
    Approved,
    Denied,
    Cancelled,
    TimedOut,
    Unavailable,
}

// ---------------------------------------------------------------------------
// Presenter seam
// ---------------------------------------------------------------------------

/// One-shot reply channel handed to a presenter.
pub struct PromptResponder(oneshot::Sender<PromptOutcome>);

impl PromptResponder {
    /// Deliver the outcome. Returns `false` if the gate already gave up.
    pub fn respond(self, outcome: PromptOutcome) -> bool {
        self.0.send(outcome).is_ok()
    }

    /// Whether the gate is still waiting.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        !self.0.is_closed()
    }
}

impl fmt::Debug for PromptResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptResponder")
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

type Dismiss = Box<dyn FnOnce() + Send>;

/// Dismisses a shown prompt when dropped, unless disarmed first.
pub struct PromptHandle {
    dismiss: Option<Dismiss>,
}

impl PromptHandle {
    #[must_use]
    pub fn new(dismiss: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dismiss: Some(Box::new(dismiss)),
        }
    }

    /// A prompt with nothing to tear down.
    #[must_use]
    pub const fn detached() -> Self {
        Self { dismiss: None }
    }

    /// The prompt closed itself; forget the dismiss action.
    pub fn disarm(mut self) {
        self.dismiss = None;
    }

    /// Tear the prompt down now.
    pub fn dismiss(mut self) {
        if let Some(f) = self.dismiss.take() {
            f();
        }
    }
}

impl Drop for PromptHandle {
    fn drop(&mut self) {
        if let Some(f) = self.dismiss.take() {
            f();
        }
    }
}

impl fmt::Debug for PromptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptHandle")
            .field("armed", &self.dismiss.is_some())
            .finish()
    }
}

/// Native prompt surface of a backend.
pub trait Presenter: Send + Sync {
    fn availability(&self) -> AvailabilityStatus;

    fn biometric_kinds(&self) -> Vec<BiometricKind>;

    /// Show a prompt and return immediately. The outcome arrives later
    /// through `responder`, from any thread.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the prompt could not be shown at all.
    fn present(
        &self,
        request: &PromptRequest,
        responder: PromptResponder,
    ) -> Result<PromptHandle, BackendError>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable flag that wakes every waiting gate when set.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelState>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once [`Self::cancel`] has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            let mut notified = std::pin::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

enum Wake {
    Reply(Result<PromptOutcome, oneshot::error::RecvError>),
    Timeout,
    Cancelled,
}

/// Synchronous front of the prompt flow.
///
/// `authenticate` blocks the calling thread. It must not be called from
/// inside an async runtime; async callers wrap it in `spawn_blocking`.
pub struct BiometricGate {
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
    shutdown: CancellationToken,
    presenting: AtomicUsize,
    last: Mutex<GateState>,
}

impl BiometricGate {
    /// Build a gate whose prompts time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Io` if the timer runtime cannot be created.
    pub fn new(timeout: Duration) -> Result<Self, VaultError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .thread_name("coffre-gate")
            .build()?;
        Ok(Self {
            runtime,
            timeout,
            shutdown: CancellationToken::new(),
            presenting: AtomicUsize::new(0),
            last: Mutex::new(GateState::Idle),
        })
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current state: `Presenting` while any prompt is up, otherwise the
    /// outcome of the last prompt (`Idle` before the first).
    #[must_use]
    pub fn state(&self) -> GateState {
        if self.presenting.load(Ordering::SeqCst) > 0 {
            return GateState::Presenting;
        }
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of prompts this gate is currently waiting on.
    #[must_use]
    pub fn presenting_count(&self) -> usize {
        self.presenting.load(Ordering::SeqCst)
    }

    /// Availability as the presenter reports it, unchanged.
    pub fn check_availability(&self, presenter: &dyn Presenter) -> AvailabilityStatus {
        presenter.availability()
    }

    /// Present `request` and wait for the answer, the timeout, or shutdown.
    pub fn authenticate(&self, presenter: &dyn Presenter, request: &PromptRequest) -> AuthResult {
        self.run(presenter, request, None)
    }

    /// Like [`Self::authenticate`], also abandoning the prompt when `cancel` fires.
    pub fn authenticate_with(
        &self,
        presenter: &dyn Presenter,
        request: &PromptRequest,
        cancel: &CancellationToken,
    ) -> AuthResult {
        self.run(presenter, request, Some(cancel))
    }

    /// Abandon every in-flight prompt and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn run(
        &self,
        presenter: &dyn Presenter,
        request: &PromptRequest,
        cancel: Option<&CancellationToken>,
    ) -> AuthResult {
        if self.shutdown.is_cancelled() || cancel.is_some_and(CancellationToken::is_cancelled) {
            return self.finish(AuthResult::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        self.presenting.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(title = %request.title, "gate presenting");

        let handle = match presenter.present(request, PromptResponder(tx)) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = ?e, "prompt could not be presented");
                self.presenting.fetch_sub(1, Ordering::SeqCst);
                return self.finish(AuthResult::Unavailable);
            }
        };

        let never = CancellationToken::new();
        let caller_cancel = cancel.unwrap_or(&never);
        let wake = self.runtime.block_on(async {
            tokio::select! {
                biased;
                reply = rx => Wake::Reply(reply),
                () = self.shutdown.cancelled() => Wake::Cancelled,
                () = caller_cancel.cancelled() => Wake::Cancelled,
                () = tokio::time::sleep(self.timeout) => Wake::Timeout,
            }
        });

        let result = match wake {
            Wake::Reply(Ok(outcome)) => {
                handle.disarm();
                match outcome {
                    PromptOutcome::Approved(token) => AuthResult::Approved(token),
                    PromptOutcome::Denied => AuthResult::Denied,
                    PromptOutcome::Cancelled => AuthResult::Cancelled,
                    PromptOutcome::Unavailable => AuthResult::Unavailable,
                }
            }
            Wake::Reply(Err(_)) => {
                tracing::warn!("prompt responder dropped without an answer");
                handle.dismiss();
                AuthResult::Unavailable
            }
            Wake::Timeout => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "prompt timed out, dismissing");
                handle.dismiss();
                AuthResult::TimedOut
            }
            Wake::Cancelled => {
                tracing::debug!("prompt cancelled, dismissing");
                handle.dismiss();
                AuthResult::Cancelled
            }
        };
        self.presenting.fetch_sub(1, Ordering::SeqCst);
        self.finish(result)
    }

    fn finish(&self, result: AuthResult) -> AuthResult {
        let state = result.state();
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = state;
        tracing::debug!(?state, "gate settled");
        result
    }
}

impl Drop for BiometricGate {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for BiometricGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiometricGate")
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    /// Presenter driven by a closure run on a helper thread.
    struct ScriptedPresenter<F> {
        script: F,
        dismissed: Arc<AtomicUsize>,
    }

    impl<F> Presenter for ScriptedPresenter<F>
    where
        F: Fn(PromptResponder) + Send + Sync + Clone + 'static,
    {
        fn availability(&self) -> AvailabilityStatus {
            AvailabilityStatus::Available
        }

        fn biometric_kinds(&self) -> Vec<BiometricKind> {
            vec![BiometricKind::Fingerprint]
        }

        fn present(
            &self,
            _request: &PromptRequest,
            responder: PromptResponder,
        ) -> Result<PromptHandle, BackendError> {
            let script = self.script.clone();
            thread::spawn(move || script(responder));
            let dismissed = Arc::clone(&self.dismissed);
            Ok(PromptHandle::new(move || {
                dismissed.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn presenter<F>(script: F) -> (ScriptedPresenter<F>, Arc<AtomicUsize>)
    where
        F: Fn(PromptResponder) + Send + Sync + Clone + 'static,
    {
        let dismissed = Arc::new(AtomicUsize::new(0));
        (
            ScriptedPresenter {
                script,
                dismissed: Arc::clone(&dismissed),
            },
            dismissed,
        )
    }

    fn request() -> PromptRequest {
        PromptRequest::new("Unlock").with_fallback("Use passcode")
    }

    #[test]
    fn approval_carries_token_and_does_not_dismiss() {
        let gate = BiometricGate::new(Duration::from_secs(5)).unwrap();
        let (p, dismissed) = presenter(|r: PromptResponder| {
            r.respond(PromptOutcome::Approved(Some(AuthToken::new(b"ctx"))));
        });
        let AuthResult::Approved(Some(token)) = gate.authenticate(&p, &request()) else {
            panic!("expected approval with token");
        };
        assert_eq!(token.expose(), b"ctx");
        assert_eq!(dismissed.load(Ordering::SeqCst), 0);
        assert_eq!(gate.state(), GateState::Approved);
        assert_eq!(gate.presenting_count(), 0);
    }

    #[test]
    fn denial_and_cancellation_stay_distinct() {
        let gate = BiometricGate::new(Duration::from_secs(5)).unwrap();
        let (deny, _) = presenter(|r: PromptResponder| {
            r.respond(PromptOutcome::Denied);
        });
        let (cancel, _) = presenter(|r: PromptResponder| {
            r.respond(PromptOutcome::Cancelled);
        });
        let (gone, _) = presenter(|r: PromptResponder| {
            r.respond(PromptOutcome::Unavailable);
        });
        assert!(matches!(gate.authenticate(&deny, &request()), AuthResult::Denied));
        assert!(matches!(gate.authenticate(&cancel, &request()), AuthResult::Cancelled));
        assert!(matches!(gate.authenticate(&gone, &request()), AuthResult::Unavailable));
    }

    #[test]
    fn silence_times_out_and_dismisses() {
        let gate = BiometricGate::new(Duration::from_millis(50)).unwrap();
        let (tx, rx) = mpsc::channel::<PromptResponder>();
        let tx = Arc::new(Mutex::new(tx));
        let (p, dismissed) = presenter(move |r: PromptResponder| {
            // Park the responder so the channel stays open.
            let _ = tx.lock().unwrap().send(r);
        });
        let started = Instant::now();
        assert!(matches!(gate.authenticate(&p, &request()), AuthResult::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(dismissed.load(Ordering::SeqCst), 1);
        assert_eq!(gate.presenting_count(), 0);
        assert_eq!(gate.state(), GateState::TimedOut);

        let late = rx.recv().unwrap();
        assert!(!late.is_waiting());
        assert!(!late.respond(PromptOutcome::Approved(None)));
    }

    #[test]
    fn dropped_responder_is_unavailable() {
        let gate = BiometricGate::new(Duration::from_secs(5)).unwrap();
        let (p, dismissed) = presenter(drop::<PromptResponder>);
        assert!(matches!(gate.authenticate(&p, &request()), AuthResult::Unavailable));
        assert_eq!(dismissed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_token_abandons_prompt() {
        let gate = BiometricGate::new(Duration::from_secs(30)).unwrap();
        let (tx, _rx) = mpsc::channel::<PromptResponder>();
        let tx = Arc::new(Mutex::new(tx));
        let (p, dismissed) = presenter(move |r: PromptResponder| {
            let _ = tx.lock().unwrap().send(r);
        });
        let token = CancellationToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.cancel();
        });
        assert!(matches!(
            gate.authenticate_with(&p, &request(), &token),
            AuthResult::Cancelled
        ));
        canceller.join().unwrap();
        assert_eq!(dismissed.load(Ordering::SeqCst), 1);
        assert_eq!(gate.presenting_count(), 0);
    }

    #[test]
    fn shut_down_gate_refuses_without_presenting() {
        let gate = BiometricGate::new(Duration::from_secs(5)).unwrap();
        let (p, dismissed) = presenter(|r: PromptResponder| {
            r.respond(PromptOutcome::Approved(None));
        });
        gate.shutdown();
        assert!(gate.is_shut_down());
        assert!(matches!(gate.authenticate(&p, &request()), AuthResult::Cancelled));
        assert_eq!(dismissed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outcome_maps_to_distinct_errors() {
        assert!(matches!(
            AuthResult::Denied.into_token(),
            Err(VaultError::AuthenticationFailed)
        ));
        assert!(matches!(
            AuthResult::Cancelled.into_token(),
            Err(VaultError::AuthenticationCancelled)
        ));
        assert!(matches!(
            AuthResult::TimedOut.into_token(),
            Err(VaultError::AuthenticationTimedOut)
        ));
        assert!(matches!(
            AuthResult::Unavailable.into_token(),
            Err(VaultError::GateUnavailable(AvailabilityStatus::HardwareUnavailable))
        ));
        assert!(matches!(AuthResult::Approved(None).into_token(), Ok(None)));
    }

    #[test]
    fn prompt_handle_dismisses_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = PromptHandle::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        handle.dismiss();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = Arc::clone(&hits);
        PromptHandle::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .disarm();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(PromptHandle::detached());
    }
}
