//! The `mercure` binary: runs the hub and issues keys and tokens.
//!
//! Exit codes: 0 success, 1 runtime failure, 2 configuration or parse
//! failure (clap's own), 130 interrupted, 143 terminated.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use clap::{Parser, Subcommand};
use jsonwebtoken::{encode, EncodingKey, Header};
use log::{error, info};
use rand::RngCore;
use serde::Serialize;
use serde_json::json;

use domain::MercureClaim;
use service::config::{self, Config};
use service::logging::Logger;

#[derive(Parser)]
#[command(name = "mercure", version, about = "A Mercure protocol hub", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub server
    Serve {
        /// Path to an env-format configuration file loaded before flags
        #[arg(long)]
        config_file: Option<PathBuf>,

        #[command(flatten)]
        config: Config,
    },
    /// Generate keys and tokens
    Issue {
        #[command(subcommand)]
        command: IssueCommand,
    },
}

#[derive(Subcommand)]
enum IssueCommand {
    /// Generate a symmetric JWK for HS256 signatures
    Jwk {
        /// Key length in bytes
        #[arg(long, default_value_t = 32)]
        size: usize,
    },
    /// Sign a Mercure JWT with an HS256 key
    Jwt {
        /// Topic selectors for the mercure.publish claim
        #[arg(long)]
        publish: Vec<String>,

        /// Topic selectors for the mercure.subscribe claim
        #[arg(long)]
        subscribe: Vec<String>,

        /// Signing key ("base64:" prefix accepted)
        #[arg(long, env = "MERCURE_JWT_KEY")]
        key: String,

        /// Token lifetime in seconds (omitted = no expiry)
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // The configuration file and the environment must be in place before
    // clap resolves the env-backed options.
    if let Some(path) = config_file_argument() {
        if let Err(e) = dotenvy::from_path(&path) {
            eprintln!("cannot load configuration file {}: {e}", path.display());
            return ExitCode::from(2);
        }
    }
    config::bootstrap_env();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, .. } => serve(config).await,
        Command::Issue { command } => issue(command),
    }
}

/// Pre-scan of the raw arguments for `--config-file`, which has to take
/// effect before the real parse.
fn config_file_argument() -> Option<PathBuf> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == "--config-file" {
            return args.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--config-file=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

async fn serve(config: Config) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::from(2);
    }
    Logger::init_logger(&config);

    let transport = match service::init_transport(&config).await {
        Ok(transport) => transport,
        Err(e) => {
            error!("Failed to initialize the transport: {e}");
            return ExitCode::from(1);
        }
    };
    let service_state = match service::AppState::new(config, transport) {
        Ok(state) => state,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };
    let app_state = match web::AppState::new(service_state.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize authorization: {e}");
            return ExitCode::from(1);
        }
    };

    let addr = service_state.config_ref().listen_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            return ExitCode::from(1);
        }
    };
    info!("Mercure hub listening on {addr}");

    // 130 for SIGINT, 143 for SIGTERM, 0 otherwise.
    let exit_code = Arc::new(AtomicU8::new(0));
    let signal_code = Arc::clone(&exit_code);
    let router = web::router::define_routes(app_state);
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal_code.store(wait_for_shutdown_signal().await, Ordering::Release);
        })
        .await;

    // Drain: close every subscriber stream, then the transport.
    service_state.subscribers.shutdown();
    service_state.hub.close().await;

    match served {
        Ok(()) => {
            info!("Shut down cleanly");
            ExitCode::from(exit_code.load(Ordering::Acquire))
        }
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::from(1)
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> u8 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Cannot install the SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return 130;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            130
        }
        _ = terminate.recv() => {
            info!("Terminated, shutting down");
            143
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> u8 {
    let _ = tokio::signal::ctrl_c().await;
    info!("Interrupted, shutting down");
    130
}

fn issue(command: IssueCommand) -> ExitCode {
    match command {
        IssueCommand::Jwk { size } => {
            println!("{}", generate_jwk(size));
            ExitCode::SUCCESS
        }
        IssueCommand::Jwt {
            publish,
            subscribe,
            key,
            ttl,
        } => {
            let material = match config::decode_key_material(&key) {
                Ok(material) => material,
                Err(e) => {
                    eprintln!("invalid key: {e}");
                    return ExitCode::from(2);
                }
            };
            match sign_token(&material, publish, subscribe, ttl) {
                Ok(token) => {
                    println!("{token}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("failed to sign the token: {e}");
                    ExitCode::from(1)
                }
            }
        }
    }
}

fn generate_jwk(size: usize) -> String {
    let mut material = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut material);
    json!({
        "kty": "oct",
        "alg": "HS256",
        "k": URL_SAFE_NO_PAD.encode(&material),
    })
    .to_string()
}

#[derive(Serialize)]
struct IssuedClaims {
    mercure: MercureClaim,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

fn sign_token(
    material: &[u8],
    publish: Vec<String>,
    subscribe: Vec<String>,
    ttl: Option<u64>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = ttl.map(|ttl| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|now| now.as_secs() + ttl)
            .unwrap_or(ttl)
    });
    let claims = IssuedClaims {
        mercure: MercureClaim {
            publish: (!publish.is_empty()).then_some(publish),
            subscribe: (!subscribe.is_empty()).then_some(subscribe),
            payload: None,
        },
        exp,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(material))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    #[test]
    fn generated_jwks_are_symmetric_keys() {
        let jwk: serde_json::Value = serde_json::from_str(&generate_jwk(32)).unwrap();
        assert_eq!(jwk["kty"], "oct");
        assert_eq!(jwk["alg"], "HS256");
        let material = URL_SAFE_NO_PAD.decode(jwk["k"].as_str().unwrap()).unwrap();
        assert_eq!(material.len(), 32);
    }

    #[test]
    fn issued_tokens_round_trip() {
        let token = sign_token(
            b"secret",
            vec!["*".to_owned()],
            vec!["https://example.com/{id}".to_owned()],
            None,
        )
        .unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = Default::default();
        let decoded = decode::<domain::claims::TokenClaims>(
            &token,
            &DecodingKey::from_secret(b"secret"),
            &validation,
        )
        .unwrap();
        let mercure = decoded.claims.mercure.unwrap();
        assert_eq!(mercure.publish.unwrap(), vec!["*"]);
        assert_eq!(mercure.subscribe.unwrap(), vec!["https://example.com/{id}"]);
    }
}
