use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use beach_narrator::auth::{AuthManager, AuthMode};
use beach_narrator::config::{ENV_SESSION, NarratorConfig};
use beach_narrator::polling::PollingClient;
use beach_narrator::telemetry::init_tracing;
use beach_narrator::{FlushEvent, NarrationPipeline, StreamSession};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "beach-narrator",
    version,
    about = "Turn a live beach terminal session into narration-sized text batches"
)]
struct Cli {
    #[arg(long, global = true, help = "Session server base URL (host:port or http[s]://...)")]
    server: Option<String>,

    #[arg(long, global = true, value_enum, help = "Whether the server expects a bearer token")]
    auth: Option<AuthArg>,

    #[arg(long, global = true, help = "Auth gateway base URL")]
    gateway: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum AuthArg {
    #[value(name = "none")]
    Disabled,
    Bearer,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a session and print each narration batch until Ctrl-C.
    Watch(SessionArgs),
    /// Fetch one snapshot over HTTP and print its text.
    Snapshot(SessionArgs),
    /// Store the long-lived credential used to mint access tokens.
    Login {
        #[arg(help = "Credential; read from stdin when omitted")]
        credential: Option<String>,
    },
    /// Remove the stored credential.
    Logout,
}

#[derive(clap::Args, Debug)]
struct SessionArgs {
    #[arg(long, env = ENV_SESSION, help = "Remote session id")]
    session: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = NarratorConfig::from_env()?;
    if let Some(server) = cli.server.as_deref() {
        config.set_server(server)?;
    }
    if let Some(auth) = cli.auth {
        config.auth.mode = match auth {
            AuthArg::Disabled => AuthMode::NotRequired,
            AuthArg::Bearer => AuthMode::Bearer,
        };
    }
    if let Some(gateway) = cli.gateway.as_deref() {
        config.auth.gateway = gateway.parse::<url::Url>().context("invalid --gateway")?;
    }

    match cli.command {
        Command::Watch(args) => watch(config, args.session).await,
        Command::Snapshot(args) => snapshot(config, args.session).await,
        Command::Login { credential } => login(config, credential).await,
        Command::Logout => {
            AuthManager::keyring(&config.auth, config.request_timeout)?.logout()?;
            println!("logged out");
            Ok(())
        }
    }
}

async fn watch(config: NarratorConfig, session_id: String) -> Result<()> {
    let auth = Arc::new(AuthManager::from_settings(
        &config.auth,
        config.request_timeout,
    )?);
    let session = StreamSession::websocket(config.session_options(), auth);
    let cancel = CancellationToken::new();
    let pipeline = NarrationPipeline::new(config.batch)
        .with_tick(config.narration_tick)
        .spawn(
            session.observe(),
            |event: FlushEvent| {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{}", event.text);
                let _ = stdout.flush();
            },
            cancel.clone(),
        );

    session.subscribe(session_id.clone());
    session.connect();
    info!(session_id = %session_id, endpoint = %session.options().endpoint, "watching session");

    let mut states = session.watch_state();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = states.borrow_and_update().clone();
                info!(state = %state, "session state");
                if let Some(failure) = state.failure() {
                    break Err(anyhow!("session ended: {failure}"));
                }
            }
        }
    };

    session.disconnect();
    cancel.cancel();
    pipeline.await.context("narration task failed")?;
    outcome
}

async fn snapshot(config: NarratorConfig, session_id: String) -> Result<()> {
    let auth = Arc::new(AuthManager::from_settings(
        &config.auth,
        config.request_timeout,
    )?);
    let client = PollingClient::new(config.server.clone(), auth, config.request_timeout)?;
    let snapshot = client
        .fetch(&session_id)
        .await
        .with_context(|| format!("failed to fetch snapshot for session {session_id}"))?;
    println!("{}", snapshot.text());
    Ok(())
}

async fn login(config: NarratorConfig, credential: Option<String>) -> Result<()> {
    let credential = match credential {
        Some(credential) => credential,
        None => {
            let mut line = String::new();
            BufReader::new(tokio::io::stdin())
                .read_line(&mut line)
                .await
                .context("failed to read credential from stdin")?;
            line
        }
    };
    let credential = credential.trim();
    if credential.is_empty() {
        bail!("credential must not be empty");
    }

    AuthManager::keyring(&config.auth, config.request_timeout)?.login(credential)?;
    println!("credential stored for {}", config.auth.gateway);
    Ok(())
}
