use thiserror::Error;

/// Everything that can end an attempt early. The executor converts these
/// into a structured `Attempt`; nothing here crosses the orchestrator
/// boundary as an `Err`.
#[derive(Debug, Error)]
pub enum CheckinError {
    /// A bounded element/page wait expired. Retryable at the account level.
    #[error("page wait timed out: {0}")]
    PageTimeout(String),

    /// The solver gave up after its bounded number of refresh rounds.
    #[error("captcha unsolved after {rounds} rounds")]
    CaptchaUnsolved { rounds: u32 },

    /// Credentials were submitted but the site did not land on the dashboard.
    #[error("login rejected")]
    LoginRejected,

    /// The claim control is missing or in a state we cannot act on.
    #[error("claim unavailable: {0}")]
    ClaimUnavailable(String),

    /// An optional collaborator (proxy, stealth script, model file) failed.
    /// Callers degrade the feature and continue; this variant is only
    /// returned when the failure leaves the attempt unable to proceed.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl CheckinError {
    pub fn unexpected<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CheckinError::Unexpected(anyhow::Error::new(err))
    }
}
