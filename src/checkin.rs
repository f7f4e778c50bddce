//! One full login-and-claim attempt for one account.
//!
//! The runner owns every resource an attempt touches: proxy pick,
//! fingerprint, browser session, vision models, cookie store. Whatever
//! happens inside, the caller gets back a finalized [`Attempt`] and the
//! browser is gone.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use rand::Rng;
use serde_derive::Serialize;

use crate::browser::{self, LaunchOptions, Session, Wait};
use crate::captcha::{CaptchaSolver, SolveOutcome, SolverConfig};
use crate::cookies::{CookieStore, StoredCookie};
use crate::error::CheckinError;
use crate::proxy::{self, ProxyConfig};
use crate::util;
use crate::vision::VisionModels;

/// Settle time after login/captcha before the page is inspected again.
const POST_LOGIN_SETTLE: Duration = Duration::from_secs(5);
/// Longest attempt message kept in reports.
const MESSAGE_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    LoginFailed,
    Timeout,
    CaptchaExhausted,
    Exception,
}

/// Finalized record of one attempt. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    /// 1 = first try for the account.
    pub sequence: u32,
    pub outcome: Outcome,
    /// Present only on success.
    pub points: Option<u64>,
    /// Account-level retries already spent when this attempt ran.
    pub retries: u32,
    pub screenshot: Option<PathBuf>,
    pub proxy: Option<String>,
    pub message: String,
}

impl Attempt {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Seam between the orchestrator and the browser-backed executor.
#[async_trait]
pub trait AttemptRunner: Send {
    /// Must always return a well-formed attempt, never panic through, and
    /// leave no browser behind.
    async fn run(&mut self, account: &Account, sequence: u32) -> Attempt;
}

/// Site plumbing: URLs, selectors, labels. All constants; nothing here is
/// computed at runtime.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub login_url: String,
    pub dashboard_url: String,
    pub earn_url: String,
    pub username_field: String,
    pub password_field: String,
    pub login_button: String,
    /// Element id of the CAPTCHA iframe.
    pub captcha_iframe: String,
    pub claim_link: String,
    pub points_heading: String,
    /// Claim-label substring meaning the reward was already collected.
    pub claimed_marker: String,
}

impl SiteConfig {
    pub fn rainyun_defaults() -> Self {
        Self {
            login_url: "https://app.rainyun.com/auth/login".to_owned(),
            dashboard_url: "https://app.rainyun.com/dashboard".to_owned(),
            earn_url: "https://app.rainyun.com/account/reward/earn".to_owned(),
            username_field: "input[name='login-field']".to_owned(),
            password_field: "input[name='login-password']".to_owned(),
            login_button: "form button[type='submit']".to_owned(),
            captcha_iframe: "tcaptcha_iframe_dy".to_owned(),
            claim_link: "div.card-body span a".to_owned(),
            points_heading: "div.card-body h3".to_owned(),
            claimed_marker: "已领取".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub headless: bool,
    /// Skips the start jitter and keeps logs chatty.
    pub debug: bool,
    /// Upper bound (minutes) of the random delay before an attempt.
    pub max_start_delay: u64,
    pub wait_timeout: Duration,
    pub solver: SolverConfig,
    pub proxy: ProxyConfig,
    pub cookie_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    pub stealth_path: PathBuf,
}

pub struct CheckinRunner {
    cfg: RunnerConfig,
    site: SiteConfig,
    http: reqwest::Client,
    cookie_store: CookieStore,
}

impl CheckinRunner {
    pub fn new(cfg: RunnerConfig, site: SiteConfig) -> anyhow::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()?;
        let cookie_store = CookieStore::new(cfg.cookie_dir.clone());
        Ok(Self {
            cfg,
            site,
            http,
            cookie_store,
        })
    }

    async fn execute(
        &self,
        session: &Session,
        models: &VisionModels,
        account: &Account,
    ) -> Result<(u64, u32), CheckinError> {
        let mut solve_rounds = 0u32;

        if let Some(cookies) = self.cookie_store.load(&account.id) {
            info!("restoring {} persisted cookie(s)", cookies.len());
            session
                .set_cookies(cookies.iter().map(StoredCookie::to_param).collect())
                .await?;
        }

        info!("opening login page");
        session.navigate(&self.site.login_url).await?;

        if self.on_dashboard(session).await? {
            info!("session cookies still valid, skipping credential entry");
        } else {
            self.login(session, models, account, &mut solve_rounds).await?;
        }

        info!("opening reward page");
        session.navigate(&self.site.earn_url).await?;
        if let Wait::TimedOut = session
            .wait_visible(&self.site.claim_link, self.cfg.wait_timeout)
            .await?
        {
            return Err(CheckinError::ClaimUnavailable("claim control not found".into()));
        }

        let label = session.text(&self.site.claim_link).await?;
        if label.contains(&self.site.claimed_marker) {
            info!("reward already collected today");
        } else {
            info!("claiming daily reward");
            session.click(&self.site.claim_link).await?;
            solve_rounds += self.solve_checkpoint(session, models).await?;
            tokio::time::sleep(POST_LOGIN_SETTLE).await;
        }

        if let Wait::TimedOut = session
            .wait_visible(&self.site.points_heading, self.cfg.wait_timeout)
            .await?
        {
            return Err(CheckinError::PageTimeout("points balance".into()));
        }
        let raw = session.text(&self.site.points_heading).await?;
        let points = util::digits(&raw)
            .ok_or_else(|| CheckinError::ClaimUnavailable("points balance unreadable".into()))?;
        info!("balance: {} points (~{:.2} CNY)", points, points as f64 / 2000.0);
        Ok((points, solve_rounds))
    }

    async fn login(
        &self,
        session: &Session,
        models: &VisionModels,
        account: &Account,
        solve_rounds: &mut u32,
    ) -> Result<(), CheckinError> {
        if let Wait::TimedOut = session
            .wait_visible(&self.site.username_field, self.cfg.wait_timeout)
            .await?
        {
            return Err(CheckinError::PageTimeout("login form".into()));
        }
        session
            .type_text(&self.site.username_field, &account.id)
            .await?;
        session
            .type_text(&self.site.password_field, &account.secret)
            .await?;
        session.click(&self.site.login_button).await?;

        *solve_rounds += self.solve_checkpoint(session, models).await?;
        tokio::time::sleep(POST_LOGIN_SETTLE).await;

        if !self.on_dashboard(session).await? {
            return Err(CheckinError::LoginRejected);
        }
        info!("login succeeded");

        // A fresh session is worth keeping for tomorrow.
        let cookies = session.cookies().await?;
        let stored: Vec<StoredCookie> = cookies.iter().map(StoredCookie::from_cookie).collect();
        if let Err(e) = self.cookie_store.save(&account.id, &stored) {
            warn!("cookie persistence failed: {:#}", e);
        }
        Ok(())
    }

    /// Probe for the CAPTCHA iframe and run the solver inside it when it
    /// shows up. Returns the solve rounds spent.
    async fn solve_checkpoint(
        &self,
        session: &Session,
        models: &VisionModels,
    ) -> Result<u32, CheckinError> {
        let iframe_selector = format!("#{}", self.site.captcha_iframe);
        match session
            .wait_visible(&iframe_selector, self.cfg.wait_timeout)
            .await?
        {
            Wait::TimedOut => {
                info!("no captcha triggered");
                return Ok(0);
            }
            Wait::Found => warn!("captcha triggered"),
        }

        session.enter_frame(&self.site.captcha_iframe);
        let solver = CaptchaSolver::new(session, &self.http, models, &self.cfg.solver);
        let outcome = solver.solve().await;
        session.exit_frame();

        match outcome? {
            SolveOutcome::Passed { rounds } => Ok(rounds + 1),
            SolveOutcome::Absent => Ok(0),
            SolveOutcome::Abandoned { rounds } => Err(CheckinError::CaptchaUnsolved { rounds }),
        }
    }

    async fn on_dashboard(&self, session: &Session) -> Result<bool, CheckinError> {
        Ok(session
            .current_url()
            .await?
            .starts_with(&self.site.dashboard_url))
    }

    /// Convert the execution result into a finalized attempt, grabbing a
    /// screenshot on failure while the session is still alive.
    async fn finalize(
        &self,
        account: &Account,
        sequence: u32,
        session: &Session,
        proxy: Option<String>,
        result: Result<(u64, u32), CheckinError>,
    ) -> Attempt {
        let masked = util::mask(&account.id);
        let (outcome, points, message) = match &result {
            Ok((points, rounds)) => {
                let message = if *rounds > 0 {
                    format!("checked in after {} captcha round(s)", rounds)
                } else {
                    "checked in".to_owned()
                };
                (Outcome::Success, Some(*points), message)
            }
            Err(e) => (classify(e), None, truncate(&e.to_string())),
        };

        let screenshot = if outcome != Outcome::Success {
            self.capture_failure(account, sequence, session).await
        } else {
            None
        };

        match outcome {
            Outcome::Success => info!("{}: {}", masked, message),
            _ => error!("{}: attempt {} failed: {}", masked, sequence, message),
        }

        Attempt {
            sequence,
            outcome,
            points,
            retries: sequence - 1,
            screenshot,
            proxy,
            message,
        }
    }

    async fn capture_failure(
        &self,
        account: &Account,
        sequence: u32,
        session: &Session,
    ) -> Option<PathBuf> {
        if fs::create_dir_all(&self.cfg.screenshot_dir).is_err() {
            return None;
        }
        let path = self.cfg.screenshot_dir.join(format!(
            "{}-attempt{}.png",
            util::account_key(&account.id),
            sequence
        ));
        match session.screenshot(&path).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("screenshot capture failed: {}", e);
                None
            }
        }
    }

    fn load_stealth_script(&self) -> Option<String> {
        match fs::read_to_string(&self.cfg.stealth_path) {
            Ok(script) => Some(script),
            Err(e) => {
                warn!(
                    "stealth script {} unavailable ({}), continuing without it",
                    self.cfg.stealth_path.display(),
                    e
                );
                None
            }
        }
    }
}

#[async_trait]
impl AttemptRunner for CheckinRunner {
    async fn run(&mut self, account: &Account, sequence: u32) -> Attempt {
        let masked = util::mask(&account.id);
        info!("attempt {} for {}", sequence, masked);

        if !self.cfg.debug && self.cfg.max_start_delay > 0 {
            let (mins, secs) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(0..=self.cfg.max_start_delay),
                    rng.gen_range(0..60u64),
                )
            };
            info!("start jitter: waiting {}m{}s", mins, secs);
            tokio::time::sleep(Duration::from_secs(mins * 60 + secs)).await;
        }

        browser::cleanup_stray_browsers();

        let proxy = proxy::acquire(&self.http, &self.cfg.proxy).await;
        let launch = LaunchOptions {
            headless: self.cfg.headless,
            user_agent: util::user_agent_for(&account.id).to_owned(),
            proxy: proxy.clone(),
            stealth_script: self.load_stealth_script(),
        };

        let session = match Session::launch(launch).await {
            Ok(session) => session,
            Err(e) => {
                error!("{}: browser launch failed: {}", masked, e);
                return Attempt {
                    sequence,
                    outcome: Outcome::Exception,
                    points: None,
                    retries: sequence - 1,
                    screenshot: None,
                    proxy,
                    message: truncate(&e.to_string()),
                };
            }
        };

        // Models live exactly as long as this attempt.
        let models = VisionModels::acquire();
        let result = self.execute(&session, &models, account).await;
        let attempt = self
            .finalize(account, sequence, &session, proxy, result)
            .await;
        drop(models);

        session.close().await;
        browser::cleanup_stray_browsers();
        attempt
    }
}

fn classify(err: &CheckinError) -> Outcome {
    match err {
        CheckinError::PageTimeout(_) => Outcome::Timeout,
        CheckinError::CaptchaUnsolved { .. } => Outcome::CaptchaExhausted,
        CheckinError::LoginRejected => Outcome::LoginFailed,
        CheckinError::ClaimUnavailable(_) => Outcome::Exception,
        CheckinError::Infrastructure(_) => Outcome::Exception,
        CheckinError::Unexpected(_) => Outcome::Exception,
    }
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= MESSAGE_LIMIT {
        return message.to_owned();
    }
    let cut: String = message.chars().take(MESSAGE_LIMIT).collect();
    format!("{}…", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_the_taxonomy() {
        assert_eq!(
            classify(&CheckinError::PageTimeout("x".into())),
            Outcome::Timeout
        );
        assert_eq!(
            classify(&CheckinError::CaptchaUnsolved { rounds: 5 }),
            Outcome::CaptchaExhausted
        );
        assert_eq!(classify(&CheckinError::LoginRejected), Outcome::LoginFailed);
        assert_eq!(
            classify(&CheckinError::Infrastructure("proxy".into())),
            Outcome::Exception
        );
    }

    #[test]
    fn truncate_bounds_messages() {
        let long = "x".repeat(500);
        let cut = truncate(&long);
        assert!(cut.chars().count() <= MESSAGE_LIMIT + 1);
        assert_eq!(truncate("short"), "short");
    }
}
