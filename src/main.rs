mod browser;
mod captcha;
mod checkin;
mod cookies;
mod error;
mod matcher;
mod orchestrator;
mod proxy;
mod util;
mod vision;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local, NaiveTime};
use clap::{Parser, ValueEnum};
use log::{info, warn, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde_derive::{Deserialize, Serialize};

use crate::captcha::SolverConfig;
use crate::checkin::{Account, CheckinRunner, RunnerConfig, SiteConfig};
use crate::orchestrator::{OrchestratorConfig, Pacing};
use crate::proxy::ProxyConfig;

/// Delay before the first run in schedule mode.
const FIRST_RUN_DELAY: Duration = Duration::from_secs(60);

fn default_empty_str() -> String {
    "".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct Profile {
    /// `|`-separated identifiers, matching the env-var format.
    #[serde(default = "default_empty_str")]
    usernames: String,
    #[serde(default = "default_empty_str")]
    passwords: String,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct MyConfig {
    profiles: HashMap<String, Profile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunMode {
    /// One pass over all accounts, then exit.
    Once,
    /// Daily at the configured time, plus a first run shortly after start.
    Schedule,
}

#[derive(Parser)]
#[command(name = "rainyun-checkin")]
#[command(version)]
struct Opts {
    /// `|`-separated account identifiers.
    #[arg(short, long, env = "RAINYUN_USERNAME")]
    username: Option<String>,
    /// `|`-separated passwords, same order as the identifiers.
    #[arg(short, long, env = "RAINYUN_PASSWORD")]
    password: Option<String>,
    /// Page wait timeout in milliseconds.
    #[arg(long, env = "TIMEOUT", default_value = "15000")]
    timeout: u64,
    /// Upper bound (minutes) of the random delay before each attempt.
    #[arg(long, env = "MAX_DELAY", default_value = "5")]
    max_delay: u64,
    #[arg(long, env = "DEBUG")]
    debug: bool,
    #[arg(long, env = "RUN_MODE", value_enum, default_value = "schedule")]
    run_mode: RunMode,
    /// Daily run time, HH:MM local.
    #[arg(long, env = "SCHEDULE_TIME", default_value = "08:00")]
    schedule_time: String,
    /// Retries per account after its first failed attempt.
    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    max_retries: u32,
    /// CAPTCHA solve rounds before an attempt gives up.
    #[arg(long, env = "CAPTCHA_ROUNDS", default_value = "5")]
    captcha_rounds: u32,
    /// Proxy provider endpoint returning `ip:port`.
    #[arg(long, env = "PROXY_API")]
    proxy_api: Option<String>,
    /// Run the browser with a visible window.
    #[arg(long)]
    headed: bool,
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "stealth.min.js")]
    stealth_script: PathBuf,
    #[arg(short = 'c', long, default_value = "default")]
    profile: String,
}

fn setup_logging(debug: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all("logs")?;
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {l} - {m}{n}",
        )))
        .build("logs/rainyun.log")?;
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} {l} - {m}{n}")))
        .build();
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = log4rs::config::Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .appender(Appender::builder().build("console", Box::new(console)))
        .build(
            Root::builder()
                .appender("logfile")
                .appender("console")
                .build(level),
        )?;
    log4rs::init_config(config)?;
    Ok(())
}

/// Pair up the `|`-separated identifier and password lists. A count
/// mismatch keeps the matching prefix; blank entries are dropped.
fn parse_accounts(usernames: &str, passwords: &str) -> Vec<Account> {
    let users: Vec<&str> = usernames.split('|').map(str::trim).collect();
    let secrets: Vec<&str> = passwords.split('|').map(str::trim).collect();
    if users.len() != secrets.len() {
        warn!("identifier/password counts differ, using the matching prefix");
    }
    users
        .into_iter()
        .zip(secrets)
        .filter(|(u, s)| !u.is_empty() && !s.is_empty())
        .map(|(u, s)| Account {
            id: u.to_owned(),
            secret: s.to_owned(),
        })
        .collect()
}

/// Next occurrence of `HH:MM` local time strictly after `now`.
fn next_daily(now: DateTime<Local>, hhmm: &str) -> anyhow::Result<DateTime<Local>> {
    let (h, m) = hhmm
        .split_once(':')
        .with_context(|| format!("schedule time {:?} is not HH:MM", hhmm))?;
    let time = NaiveTime::from_hms_opt(h.parse()?, m.parse()?, 0)
        .with_context(|| format!("schedule time {:?} out of range", hhmm))?;
    let mut next = now.date_naive().and_time(time);
    if next <= now.naive_local() {
        next += chrono::Duration::days(1);
    }
    next.and_local_timezone(now.timezone())
        .earliest()
        .context("schedule time does not exist in the local timezone")
}

/// True when the sleep was cut short by an operator interrupt.
async fn sleep_or_interrupt(duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = tokio::signal::ctrl_c() => true,
    }
}

async fn run_all(
    accounts: &[Account],
    runner: &mut CheckinRunner,
    cfg: &OrchestratorConfig,
    cancel: &AtomicBool,
    data_dir: &Path,
) {
    let report = orchestrator::run_accounts(accounts, runner, cfg, cancel).await;
    for result in &report.results {
        match result.attempt.points {
            Some(points) => info!(
                "{}: {:?}, balance {} points",
                result.account, result.attempt.outcome, points
            ),
            None => info!("{}: {:?}", result.account, result.attempt.outcome),
        }
    }
    // Structured results for whatever renders or delivers reports.
    match serde_json::to_string_pretty(&report) {
        Ok(raw) => {
            let path = data_dir.join("last_run.json");
            if let Err(e) = std::fs::write(&path, raw) {
                warn!("could not write {}: {}", path.display(), e);
            }
        }
        Err(e) => warn!("report serialization failed: {}", e),
    }
}

async fn schedule_loop(
    accounts: &[Account],
    runner: &mut CheckinRunner,
    cfg: &OrchestratorConfig,
    cancel: &AtomicBool,
    opts: &Opts,
) -> anyhow::Result<()> {
    info!(
        "schedule mode: daily at {}, first run in {}s (Ctrl-C to stop)",
        opts.schedule_time,
        FIRST_RUN_DELAY.as_secs()
    );
    if sleep_or_interrupt(FIRST_RUN_DELAY).await {
        info!("interrupted before the first run");
        return Ok(());
    }
    run_all(accounts, runner, cfg, cancel, &opts.data_dir).await;

    loop {
        if cancel.load(Ordering::SeqCst) {
            info!("interrupted, stopping the scheduler");
            return Ok(());
        }
        let now = Local::now();
        let next = next_daily(now, &opts.schedule_time)?;
        let wait = (next - now).to_std().unwrap_or_default();
        info!(
            "next run at {} ({}h{}m from now)",
            next.format("%Y-%m-%d %H:%M:%S"),
            wait.as_secs() / 3600,
            (wait.as_secs() % 3600) / 60
        );
        if sleep_or_interrupt(wait).await {
            info!("interrupted, stopping the scheduler");
            return Ok(());
        }
        run_all(accounts, runner, cfg, cancel, &opts.data_dir).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut opts: Opts = Opts::parse();

    if let Ok(config_path) = confy::get_configuration_file_path("rainyun-checkin", None) {
        println!("Config path: {:?}", config_path);
    }
    if let Ok(cfg) = confy::load::<MyConfig>("rainyun-checkin", None) {
        if let Some(profile) = cfg.profiles.get(&opts.profile) {
            if opts.username.is_none() {
                opts.username = Some(profile.usernames.clone());
                opts.password = Some(profile.passwords.clone());
            }
        }
    }

    setup_logging(opts.debug)?;
    info!("------------------------------------------------------------------");
    info!("rainyun-checkin v{}", env!("CARGO_PKG_VERSION"));
    info!("------------------------------------------------------------------");

    let accounts = parse_accounts(
        opts.username.as_deref().unwrap_or(""),
        opts.password.as_deref().unwrap_or(""),
    );
    if accounts.is_empty() {
        anyhow::bail!("no accounts configured; set RAINYUN_USERNAME and RAINYUN_PASSWORD");
    }
    info!("{} account(s) configured", accounts.len());
    for (i, account) in accounts.iter().enumerate() {
        info!("account {}: {}", i + 1, util::mask(&account.id));
    }

    std::fs::create_dir_all(&opts.data_dir)
        .with_context(|| format!("creating {}", opts.data_dir.display()))?;
    browser::cleanup_stray_browsers();

    let site = SiteConfig::rainyun_defaults();
    let runner_cfg = RunnerConfig {
        headless: !opts.headed,
        debug: opts.debug,
        max_start_delay: if opts.debug { 0 } else { opts.max_delay },
        wait_timeout: Duration::from_millis(opts.timeout),
        solver: SolverConfig {
            max_rounds: opts.captcha_rounds,
            wait_timeout: Duration::from_millis(opts.timeout),
            ..SolverConfig::default()
        },
        proxy: ProxyConfig {
            api_url: opts.proxy_api.clone(),
            probe_url: site.login_url.clone(),
            probe_timeout: Duration::from_secs(5),
        },
        cookie_dir: opts.data_dir.join("cookies"),
        screenshot_dir: opts.data_dir.join("screenshots"),
        stealth_path: opts.stealth_script.clone(),
    };
    let mut runner = CheckinRunner::new(runner_cfg, site)?;
    let orchestrator_cfg = OrchestratorConfig {
        max_retries: opts.max_retries,
        pacing: if opts.debug {
            Pacing::none()
        } else {
            Pacing::default()
        },
    };

    // One interrupt flag for the whole process; the orchestrator honors it
    // between accounts and rounds, never mid-attempt.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    match opts.run_mode {
        RunMode::Once => {
            info!("run mode: once");
            run_all(&accounts, &mut runner, &orchestrator_cfg, &cancel, &opts.data_dir).await;
        }
        RunMode::Schedule => {
            schedule_loop(&accounts, &mut runner, &orchestrator_cfg, &cancel, &opts).await?;
        }
    }

    browser::cleanup_stray_browsers();
    info!("done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_accounts_pairs_and_filters() {
        let accounts = parse_accounts("alice@x.com|bob@x.com", "pw1|pw2");
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[1].id, "bob@x.com");
        assert_eq!(accounts[1].secret, "pw2");
    }

    #[test]
    fn parse_accounts_truncates_on_mismatch() {
        let accounts = parse_accounts("alice|bob|carol", "pw1|pw2");
        assert_eq!(accounts.len(), 2);
    }

    #[test]
    fn parse_accounts_drops_blanks() {
        let accounts = parse_accounts("alice| |bob", "pw1|pw2|");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "alice");
    }

    #[test]
    fn next_daily_rolls_to_tomorrow() {
        let now = Local.with_ymd_and_hms(2025, 3, 10, 9, 30, 0).unwrap();
        let next = next_daily(now, "08:00").unwrap();
        assert_eq!(next.format("%Y-%m-%d %H:%M").to_string(), "2025-03-11 08:00");

        let next = next_daily(now, "23:15").unwrap();
        assert_eq!(next.format("%Y-%m-%d %H:%M").to_string(), "2025-03-10 23:15");
    }

    #[test]
    fn next_daily_rejects_garbage() {
        let now = Local::now();
        assert!(next_daily(now, "8am").is_err());
        assert!(next_daily(now, "25:00").is_err());
    }
}
