use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_gateway::config::SttBackendKind;
use voice_gateway::{
    create_router, AppState, Authenticator, Config, Engines, HttpSpeechSynthesizer,
    HttpSpeechToText, InMemoryConversationStore, JwtAuthenticator, NatsSpeechToText,
    OllamaLanguageModel, OpenAuthenticator, Pipeline, SpeechToText,
};

#[derive(Parser)]
#[command(name = "voice-gateway")]
#[command(about = "Voice assistant conversation gateway")]
struct Args {
    /// Config file, without extension
    #[arg(short, long, default_value = "config/voice-gateway")]
    config: String,

    /// Override the HTTP port from the config file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("voice_gateway=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    let stt: Arc<dyn SpeechToText> = match cfg.stt.backend {
        SttBackendKind::Http => {
            info!("Speech-to-text over HTTP at {}", cfg.stt.base_url);
            Arc::new(HttpSpeechToText::new(cfg.stt.base_url.clone())?)
        }
        SttBackendKind::Nats => {
            info!("Speech-to-text over NATS at {}", cfg.nats.url);
            Arc::new(
                NatsSpeechToText::connect(&cfg.nats.url)
                    .await
                    .context("Failed to connect to NATS")?,
            )
        }
    };

    info!("Language model {} at {}", cfg.llm.model, cfg.llm.base_url);
    info!("Speech synthesis at {}", cfg.tts.url);

    let engines = Engines {
        stt,
        llm: Arc::new(OllamaLanguageModel::new(cfg.llm.clone())?),
        tts: Arc::new(HttpSpeechSynthesizer::new(cfg.tts.clone())?),
        store: Arc::new(InMemoryConversationStore::new()),
    };

    let authenticator: Arc<dyn Authenticator> = if cfg.auth.enabled {
        if cfg.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must be set when auth is enabled");
        }
        Arc::new(JwtAuthenticator::new(&cfg.auth.jwt_secret))
    } else {
        warn!("Authentication disabled, every connection is the local user");
        Arc::new(OpenAuthenticator)
    };

    let pipeline = Arc::new(Pipeline::new(engines, &cfg.session));
    let state = AppState::new(pipeline, authenticator, cfg.session.clone());
    let app = create_router(state);

    let port = args.port.unwrap_or(cfg.service.http.port);
    let addr = format!("{}:{}", cfg.service.http.bind, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Listening on {}", addr);
    axum::serve(listener, app).await.context("HTTP server failed")?;

    Ok(())
}
