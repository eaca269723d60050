use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cadence_gateway::voice::{DeepgramLive, SpeechSynthesizer, TextToSpeech, write_wav};
use cadence_gateway::{ApiServerBuilder, ChatClient, Config, SessionServices};

/// Cadence - turn-taking voice conversation gateway
#[derive(Parser)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Directory with the web client (overrides config)
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Synthesize text to a WAV file
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Output file
        #[arg(short, long, default_value = "cadence-tts.wav")]
        out: PathBuf,
    },
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,cadence_gateway=info",
        1 => "info,cadence_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.static_dir.is_some() {
        config.server.static_dir = cli.static_dir;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::TestTts { text, out } => test_tts(&config, &text, &out).await,
        Command::Check => check(&config),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let services = SessionServices {
        transcription: Arc::new(DeepgramLive::new(&config.stt)?),
        generator: Arc::new(ChatClient::new(&config.llm)?),
        synthesizer: Arc::new(TextToSpeech::from_config(&config.tts)?),
    };

    tracing::info!(
        port = config.server.port,
        stt_model = %config.stt.model,
        llm_model = %config.llm.model,
        tts = %config.tts.provider,
        silence_ms = config.turn.silence_threshold.as_millis(),
        interrupt = ?config.turn.interrupt,
        link = ?config.turn.link,
        "starting cadence gateway"
    );

    let server = ApiServerBuilder::new(services, config).build();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

/// Synthesize `text` and write it to `out`
async fn test_tts(config: &Config, text: &str, out: &std::path::Path) -> anyhow::Result<()> {
    let tts = TextToSpeech::from_config(&config.tts)?;
    println!("Synthesizing with {}...", config.tts.provider);

    let pcm = tts.synthesize(text).await?;
    write_wav(out, &pcm, tts.sample_rate())?;

    println!(
        "Wrote {} bytes of {} Hz audio to {}",
        pcm.len(),
        tts.sample_rate(),
        out.display()
    );
    Ok(())
}

fn check(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    println!("Configuration OK");
    println!("  listen:       {}:{}", config.server.host, config.server.port);
    println!("  transcription: Deepgram {} ({})", config.stt.model, config.stt.language);
    println!("  generation:   {} @ {}", config.llm.model, config.llm.base_url);
    println!("  synthesis:    {} {} ({})", config.tts.provider, config.tts.model, config.tts.voice);
    println!(
        "  turn-taking:  silence {:.1}s, interrupt {:?}, link {:?}",
        config.turn.silence_threshold.as_secs_f64(),
        config.turn.interrupt,
        config.turn.link
    );
    Ok(())
}
