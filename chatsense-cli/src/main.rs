//! chatsense: live Twitch chat sentiment in the terminal.
//!
//!   chatsense watch <channel>   Analyse a channel until Ctrl-C
//!   chatsense history [--json]  List saved analyses
//!
//! While watching, `r` + Enter reconnects after the client gave up.
//!
//! Credentials come from `--email`/`--password` or `CHATSENSE_EMAIL` /
//! `CHATSENSE_PASSWORD`. Other settings can live in
//! `~/.config/chatsense/config.toml`.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use chatsense_sdk::{
    AnalysisSession, ApiClient, ConnectionState, ConnectionStatus, HistoryEntry, RetryState,
    Sentiment, StreamClient, StreamError,
};
use tokio::sync::mpsc;

use config::{Config, Resolved, Session};

#[derive(Parser, Debug)]
#[command(name = "chatsense", about = "Live Twitch chat sentiment analysis", version)]
pub struct Cli {
    /// Backend base URL
    #[arg(long, env = "CHATSENSE_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Account email
    #[arg(long, env = "CHATSENSE_EMAIL", global = true)]
    pub email: Option<String>,

    /// Account password
    #[arg(long, env = "CHATSENSE_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyse a channel's chat live
    Watch(WatchArgs),
    /// List saved analyses
    History(HistoryArgs),
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Print the raw entries as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Channel name or Twitch URL (defaults to the last one watched)
    pub channel: Option<String>,

    /// Stream transport: sse or ws
    #[arg(long)]
    pub transport: Option<String>,

    /// Reconnect automatically when retries run out
    #[arg(long)]
    pub auto_retry: bool,

    /// Save the analysis to history on exit
    #[arg(long)]
    pub save: bool,

    /// Seconds between summaries
    #[arg(long)]
    pub summary_secs: Option<u64>,

    /// Reconnect attempts before giving up
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatsense=info,chatsense_sdk=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load();
    let mut saved = Session::load();
    let resolved = Resolved::merge(&cli, &config, &saved)?;

    let api = Arc::new(ApiClient::new(&resolved.api_url)?);
    login(&api, &resolved).await?;

    match cli.command {
        Command::Watch(_) => watch(api, &resolved, &mut saved).await,
        Command::History(args) => history(&api, args.json).await,
    }
}

async fn login(api: &ApiClient, resolved: &Resolved) -> Result<()> {
    let email = resolved
        .email
        .as_deref()
        .context("no email: pass --email, set CHATSENSE_EMAIL or add `email` to the config file")?;
    let password = resolved
        .password
        .as_deref()
        .context("no password: pass --password or set CHATSENSE_PASSWORD")?;
    let user = api
        .login(email, password)
        .await
        .with_context(|| format!("login failed for {email}"))?;
    println!("Logged in as {}", user.display_name());
    Ok(())
}

async fn watch(api: Arc<ApiClient>, resolved: &Resolved, saved: &mut Session) -> Result<()> {
    let channel = resolved
        .channel
        .clone()
        .context("no channel given and none watched before")?;

    let transport = resolved.transport.build(&resolved.api_url, api.http_client());
    let stream = StreamClient::with_policy(transport, resolved.policy.clone());
    let session = AnalysisSession::new(api, stream);

    let handle = session
        .start_session(&channel)
        .await
        .with_context(|| format!("could not start analysis of {channel}"))?;
    println!("Analysing #{} (Ctrl-C to stop)", handle.channel());
    saved.last_channel = Some(handle.channel().to_string());
    saved.save();

    let mut status_rx = session.watch_status();
    let mut ticker = tokio::time::interval(resolved.summary_interval);
    ticker.tick().await;
    let mut input = stdin_lines();
    let mut input_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                print_status(&status, session.stream().retry_state());
                if status.last_error == Some(StreamError::EndedByBackend) {
                    println!("The backend stopped analysing #{}.", handle.channel());
                    break;
                }
                if status.state == ConnectionState::Failed {
                    if resolved.auto_retry {
                        println!("Retrying in {}s", resolved.policy.reconnect_grace.as_secs_f32());
                        session.reconnect();
                    } else {
                        println!("Press r + Enter to retry, Ctrl-C to quit.");
                    }
                }
            }
            line = input.recv(), if input_open => match line {
                Some(line) if wants_retry(&line) => {
                    if session.status().state == ConnectionState::Failed {
                        println!("Retrying in {}s", resolved.policy.reconnect_grace.as_secs_f32());
                        session.reconnect();
                    }
                }
                Some(_) => {}
                None => input_open = false,
            },
            _ = ticker.tick() => print_summary(&session),
            _ = &mut ctrl_c => {
                println!();
                break;
            }
        }
    }

    print_summary(&session);
    if resolved.save_on_exit {
        match session.save_history().await {
            Ok(id) => println!("Saved analysis {id}"),
            Err(e) => eprintln!("Could not save analysis: {e}"),
        }
    }
    if let Err(e) = session.logout().await {
        tracing::warn!(error = %e, "Logout failed");
    }
    Ok(())
}

/// Lines typed on stdin. Read on a plain thread so a pending read never
/// holds up runtime shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn wants_retry(line: &str) -> bool {
    matches!(line.trim(), "r" | "R" | "retry")
}

fn print_status(status: &ConnectionStatus, retry: RetryState) {
    let err = status
        .last_error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_default();
    match status.state {
        ConnectionState::Connecting => println!("… connecting"),
        ConnectionState::Connected => println!("● connected"),
        ConnectionState::Reconnecting => println!(
            "↻ reconnecting (attempt {}/{}): {err}",
            retry.attempt, retry.max_attempts
        ),
        ConnectionState::Failed => println!("✖ connection failed: {err}"),
        ConnectionState::Disconnected => println!("○ disconnected"),
    }
}

fn print_summary<A: chatsense_sdk::ChannelApi>(session: &AnalysisSession<A>) {
    let Some(channel) = session.channel() else { return };
    let counts = session.counts();
    let elapsed = session
        .started_at()
        .map(|t| (chrono::Utc::now() - t).num_seconds().max(0))
        .unwrap_or(0);
    let top = session
        .top_users()
        .map(|(s, (user, n))| format!("{}: {user} ({n})", short_label(s)))
        .join("  ");
    println!(
        "[{}] #{channel} {} msgs in {} | +{} ~{} -{} | {top}",
        chrono::Local::now().format("%H:%M:%S"),
        counts.total(),
        format_duration(Duration::from_secs(elapsed as u64)),
        counts.positive,
        counts.neutral,
        counts.negative,
    );
}

fn short_label(s: Sentiment) -> &'static str {
    match s {
        Sentiment::Positive => "top+",
        Sentiment::Neutral => "top~",
        Sentiment::Negative => "top-",
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

async fn history(api: &ApiClient, json: bool) -> Result<()> {
    let entries = api.list_history().await.context("could not load history")?;
    if json {
        println!("{}", history_json(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No saved analyses yet.");
        return Ok(());
    }
    println!("{:<24} {:>8} {:>6} {:>6} {:>6} {:>10}", "CHANNEL", "CHATS", "POS", "NEU", "NEG", "DURATION");
    for e in entries {
        let duration = e
            .duration
            .map(|s| format_duration(Duration::from_secs(s.max(0) as u64)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:>8} {:>6} {:>6} {:>6} {:>10}",
            e.streamer_name,
            e.total_chats,
            e.sentiment_count.positive,
            e.sentiment_count.neutral,
            e.sentiment_count.negative,
            duration,
        );
    }
    Ok(())
}

fn history_json(entries: &[HistoryEntry]) -> Result<String> {
    Ok(serde_json::to_string_pretty(entries)?)
}
