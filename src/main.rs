use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt as _;
use keygate_auth::{AuthManager, callback::CALLBACK_TIMEOUT, flow};
use keygate_config::{Config, EncryptionMode, LogFormat};
use keygate_provider::{Dispatch, ExecutorRegistry, ModelRouter};
use keygate_store::{CredentialStore, FileBackend, Sealer};
use keygate_types::{ChunkStream, CredentialStatus, DEFAULT_IDENTITY, ProviderId, Request, StreamChunk, StreamEnd, unix_now};
use serde_json::{Value, json};
use std::{io::Write, path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keygate", version, about = "keygate: credential-owning LLM gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authenticate with a provider (browser OAuth unless a key or JWT is given).
    Login {
        provider: ProviderId,
        /// Identity to store the credential under (default: account e-mail or "default").
        #[arg(long)]
        identity: Option<String>,
        /// Store a static API key instead of running OAuth.
        #[arg(long, value_name = "KEY", conflicts_with = "jwt")]
        api_key: Option<String>,
        /// Store a bearer JWT cookie for rotating-token exchange.
        #[arg(long, value_name = "TOKEN")]
        jwt: Option<String>,
    },
    /// Revoke and remove a stored credential.
    Logout {
        provider: ProviderId,
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        identity: String,
    },
    /// Show stored credentials for every configured provider.
    Status,
    /// Send one prompt through the router.
    Chat {
        #[arg(short, long)]
        model: String,
        #[arg(long)]
        stream: bool,
        prompt: String,
    },
    /// Print a fresh store encryption key (64 hex characters).
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if matches!(cli.command, Commands::Keygen) {
        println!("{}", Sealer::generate_key());
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config);

    let store = Arc::new(open_store(&config).await?);
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;
    let auth = Arc::new(AuthManager::from_config(&config, store, &http));

    match cli.command {
        Commands::Login {
            provider,
            identity,
            api_key,
            jwt,
        } => cmd_login(&auth, &provider, identity, api_key, jwt).await,
        Commands::Logout { provider, identity } => {
            auth.logout(&provider, &identity)
                .await
                .with_context(|| format!("logout {provider}/{identity}"))?;
            eprintln!("{provider}/{identity} logged out");
            Ok(())
        }
        Commands::Status => cmd_status(&config, &auth).await,
        Commands::Chat {
            model,
            stream,
            prompt,
        } => cmd_chat(&config, auth, &http, model, stream, &prompt).await,
        Commands::Keygen => Ok(()),
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn open_store(config: &Config) -> Result<CredentialStore> {
    let sealer = match config.store.encryption {
        EncryptionMode::Aes256Gcm => Some(Sealer::from_env(&config.store.key_env).with_context(|| {
            format!(
                "store encryption needs a key in {}; generate one with `keygate keygen`",
                config.store.key_env
            )
        })?),
        EncryptionMode::None => {
            tracing::warn!("credential store encryption is disabled");
            None
        }
    };
    let dir = config.store.resolved_dir();
    let backend = FileBackend::open(&dir, sealer)
        .await
        .with_context(|| format!("opening credential store at {}", dir.display()))?;
    Ok(CredentialStore::with_ttl(
        Arc::new(backend),
        Duration::from_secs(config.store.cache_ttl_secs),
    ))
}

async fn cmd_login(
    auth: &AuthManager,
    provider: &ProviderId,
    identity: Option<String>,
    api_key: Option<String>,
    jwt: Option<String>,
) -> Result<()> {
    let identity_or_default = || identity.clone().unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
    let reference = if let Some(key) = api_key {
        flow::save_api_key(auth, provider, &identity_or_default(), &key).await
    } else if let Some(token) = jwt {
        flow::save_jwt_cookie(auth, provider, &identity_or_default(), &token).await
    } else {
        flow::login(auth, provider, identity.as_deref(), CALLBACK_TIMEOUT).await
    }
    .with_context(|| format!("login to {provider} failed"))?;
    eprintln!("logged in as {reference}");
    Ok(())
}

async fn cmd_status(config: &Config, auth: &AuthManager) -> Result<()> {
    let mut providers = auth.providers();
    providers.extend(config.executors.iter().map(|e| e.provider.clone()));
    providers.sort();
    providers.dedup();

    let now = unix_now();
    for provider in &providers {
        let credentials = auth
            .credentials(provider)
            .await
            .with_context(|| format!("listing {provider} credentials"))?;
        if credentials.is_empty() {
            println!("{provider}: not authenticated");
            continue;
        }
        for entry in credentials {
            match entry {
                Ok(c) => {
                    let state = match (c.status, c.expires_at()) {
                        (CredentialStatus::Revoked, _) => "revoked".to_string(),
                        (_, _) if c.is_expired_at(now) => "expired".to_string(),
                        (_, Some(exp)) => format!("active, expires in {}m", exp.saturating_sub(now) / 60),
                        (_, None) => "active".to_string(),
                    };
                    println!("{provider}/{} [{}]: {state}", c.identity, c.kind());
                }
                Err(e) => println!("{provider}: unreadable credential: {e}"),
            }
        }
    }
    Ok(())
}

async fn cmd_chat(
    config: &Config,
    auth: Arc<AuthManager>,
    http: &reqwest::Client,
    model: String,
    stream: bool,
    prompt: &str,
) -> Result<()> {
    let registry = ExecutorRegistry::from_config(config, &auth, http)?;
    let router = ModelRouter::from_config(config, registry)?;
    let request = Request::openai(json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": prompt}],
    }))?;

    let ctx = CancellationToken::new();
    let on_interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    if !stream {
        let Dispatch { result, trace } = router.dispatch(&ctx, &request).await;
        tracing::debug!(?trace, "dispatch finished");
        let resp = result?;
        let text = resp
            .payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        println!("{text}");
        return Ok(());
    }

    let Dispatch { result, trace } = router.dispatch_stream(&ctx, &request).await;
    tracing::debug!(?trace, "stream accepted");
    let mut chunks = result?;
    print_stream(&mut chunks, &mut std::io::stdout()).await
}

/// Writes streamed content deltas to `out`. Fails unless the stream completed.
async fn print_stream(chunks: &mut ChunkStream, out: &mut impl Write) -> Result<()> {
    while let Some(chunk) = chunks.next().await {
        match chunk {
            StreamChunk::Data(v) => {
                if let Some(text) = v.pointer("/choices/0/delta/content").and_then(Value::as_str) {
                    write!(out, "{text}")?;
                    out.flush()?;
                }
            }
            StreamChunk::Error(e) => {
                writeln!(out)?;
                return Err(e.into());
            }
        }
    }
    writeln!(out)?;
    tracing::debug!(end = ?chunks.end(), "stream closed");
    match chunks.end() {
        Some(StreamEnd::Completed) => Ok(()),
        end => anyhow::bail!("stream ended without completing ({end:?})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_types::{GatewayError, channel};

    fn delta(text: &str) -> Value {
        json!({"choices": [{"delta": {"content": text}}]})
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_print_completed_stream() {
        let (tx, mut rx) = channel(4);
        tokio::spawn(async move {
            tx.send(delta("hel")).await;
            tx.send(delta("lo")).await;
            tx.finish(StreamEnd::Completed).await;
        });
        let mut out = Vec::new();
        print_stream(&mut rx, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let (tx, mut rx) = channel(4);
        tokio::spawn(async move {
            tx.send(delta("partial")).await;
            drop(tx);
        });
        let mut out = Vec::new();
        let err = print_stream(&mut rx, &mut out).await.unwrap_err();
        assert!(err.to_string().contains("Truncated"));
        assert_eq!(String::from_utf8(out).unwrap(), "partial\n");
    }

    #[tokio::test]
    async fn test_error_chunk_is_returned() {
        let (tx, mut rx) = channel(4);
        tokio::spawn(tx.fail(GatewayError::upstream(529, "overloaded")));
        let err = print_stream(&mut rx, &mut Vec::new()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::Upstream { status: 529, .. })
        ));
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let (tx, mut rx) = channel(4);
        tokio::spawn(async move {
            tx.send(delta("x")).await;
            tx.finish(StreamEnd::Completed).await;
        });
        let err = print_stream(&mut rx, &mut BrokenPipe).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<std::io::Error>().map(std::io::Error::kind),
            Some(std::io::ErrorKind::BrokenPipe)
        );
    }
}
