use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use voicewire::context::{ContextProtocol, ContextSource, FileContextSource};
use voicewire::credential::{CredentialBroker, CredentialProvider};
use voicewire::transport::{TransportConnector, WsDialer};
use voicewire::voice::{
    AudioCapture, AudioSource, CpalSink, PlaybackQueue, SAMPLE_RATE, encode_pcm16, f32_to_i16,
    rms_i16,
};
use voicewire::{
    Config, ConnectRequest, RelayServer, SessionController, SessionParts, SessionPhase,
    SessionUpdate,
};

/// Voicewire - Realtime voice relay and client
#[derive(Parser)]
#[command(name = "voicewire", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (default)
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a voice session against the relay
    Connect {
        /// Caller identifier carried in the session context
        #[arg(long)]
        caller: Option<String>,
        /// Session phase (exploration, analysis, reflection)
        #[arg(long, default_value = "exploration")]
        phase: SessionPhase,
        /// File whose contents become the enhanced context
        #[arg(long)]
        context_file: Option<PathBuf>,
        /// Text-only session without microphone capture
        #[arg(long)]
        no_mic: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voicewire=info",
        1 => "info,voicewire=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
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
    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => serve(port).await,
        Command::Connect {
            caller,
            phase,
            context_file,
            no_mic,
        } => connect(caller, phase, context_file, no_mic).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Run the relay until Ctrl-C
async fn serve(port: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = port {
        config.relay.port = port;
    }

    if config.relay.upstream_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set, upstream will likely reject sessions");
    }
    if config.relay.client_api_key.is_none() {
        tracing::warn!("VOICEWIRE_API_KEY not set, any bearer identity may mint credentials");
    }

    let addr = format!("0.0.0.0:{}", config.relay.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;

    let server = RelayServer::new(config.relay);
    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down relay");
        })
        .await?;

    Ok(())
}

/// Run a client session until Ctrl-C
async fn connect(
    caller: Option<String>,
    phase: SessionPhase,
    context_file: Option<PathBuf>,
    no_mic: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let options = config.session_options();

    let broker: Arc<dyn CredentialProvider> = Arc::new(CredentialBroker::new(
        CredentialBroker::endpoint_for(&config.session.relay_url)?,
        config.session.identity,
    ));
    let connector = Arc::new(
        TransportConnector::new(Arc::new(WsDialer::new(config.session.relay_url.clone())))
            .with_negotiation_timeout(config.session.negotiation_timeout)
            .with_encoding(config.session.audio_transport),
    );
    let source = context_file
        .map(|path| Arc::new(FileContextSource::new(path)) as Arc<dyn ContextSource>);
    let context = ContextProtocol::new(source)
        .with_enhance_timeout(config.context.enhance_timeout)
        .with_ack_grace(config.context.ack_grace);
    let playback = PlaybackQueue::new(Arc::new(CpalSink::new()?));
    let capture = (!no_mic).then(|| {
        let capture =
            AudioCapture::new(config.audio.capture).with_echo_reference(playback.activity());
        let processing = capture.processing();
        tracing::info!(
            echo_cancellation = processing.echo_cancellation,
            noise_suppression = processing.noise_suppression,
            auto_gain = processing.auto_gain,
            "microphone processing"
        );
        Box::new(capture) as Box<dyn AudioSource>
    });

    let mut controller = SessionController::spawn(
        SessionParts {
            broker,
            connector,
            context,
            playback,
            capture,
        },
        options,
    );

    let mut updates = controller
        .take_updates()
        .ok_or_else(|| anyhow::anyhow!("session updates already taken"))?;
    let mut status = controller.status();

    controller
        .connect(ConnectRequest {
            caller_id: caller,
            phase,
        })
        .await?;
    println!("Connecting to {} (Ctrl-C to stop)\n", config.session.relay_url);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                println!("[{current}]");
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                print_update(&update);
            }
        }
    }

    controller.disconnect().await?;
    controller.dispose().await;
    Ok(())
}

fn print_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::TranscriptDelta(delta) => {
            use std::io::Write;
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        SessionUpdate::TranscriptDone(_) => println!(),
        SessionUpdate::InputTranscript(text) => println!("you: {text}"),
        SessionUpdate::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } => println!(
            "connection lost, retry {attempt}/{max_attempts} in {}ms",
            delay.as_millis()
        ),
        SessionUpdate::Exhausted { attempts } => {
            println!("gave up after {attempts} reconnect attempts");
        }
        SessionUpdate::ContextDelivered(outcome) => {
            tracing::debug!(?outcome, "context delivered");
        }
        SessionUpdate::SilenceDetected => tracing::debug!("silence detected"),
        SessionUpdate::AudioDeviceError(e) => println!("microphone error: {e}"),
        SessionUpdate::RemoteError(e) => println!("remote error: {e}"),
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new(Config::load()?.audio.capture);
    let (frames_tx, mut frames_rx) = mpsc::channel(64);
    capture.start(frames_tx).await?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.tick().await;
    let mut window: Vec<i16> = Vec::new();
    let mut second = 0u64;

    loop {
        tokio::select! {
            () = &mut deadline => break,
            frame = frames_rx.recv() => {
                let Some(frame) = frame else { break };
                window.extend_from_slice(frame.samples());
            }
            _ = tick.tick() => {
                second += 1;
                let energy = rms_i16(&window);
                let peak = window.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);

                // Visual meter
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = (energy * 100.0).min(50.0) as usize;
                let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

                println!("[{second:2}s] RMS: {energy:.4} | Peak: {peak:5} | [{meter}]");
                window.clear();
            }
        }
    }

    capture.stop()?;

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave through the playback queue
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = PlaybackQueue::new(Arc::new(CpalSink::new()?));
    playback.init();

    let frequency = 440.0_f32;
    let chunk_samples = SAMPLE_RATE as usize / 4;

    // Eight quarter-second chunks, queued back to back
    for chunk in 0..8 {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<i16> = (0..chunk_samples)
            .map(|i| {
                let t = (chunk * chunk_samples + i) as f32 / SAMPLE_RATE as f32;
                f32_to_i16((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3)
            })
            .collect();
        playback.enqueue(encode_pcm16(&samples));
    }

    while playback.is_playing() || playback.pending() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    playback.dispose();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}
