use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr::{Keys, PublicKey, Timestamp};
use nostr_call::config::{ensure_nsec_at, get_config_path, get_nsec_path, write_nsec_at};
use nostr_call::{
    Config, Identity, PeerDirectory, RelayPool, RtcBackend, SessionContext, SessionEvent,
    SessionHandle, WebSocketRelayClient,
};
use std::future::Future;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "nostr-call")]
#[command(about = "Peer-to-peer audio/video calls signaled over Nostr relays", long_about = None)]
struct Cli {
    /// Config file (default: ~/.nostr-call/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Relay URL, repeatable; replaces the configured relays
    #[arg(long = "relay", global = true)]
    relays: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local identity (or show the existing one)
    Keygen {
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },
    /// Print the local npub and hex key
    Whoami,
    /// Wait for calls and answer them
    Listen,
    /// Call a peer
    Call {
        /// npub or hex public key
        peer: String,
    },
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(get_config_path)
    }

    /// The nsec lives next to the config file
    fn nsec_path(&self) -> PathBuf {
        self.config
            .as_ref()
            .and_then(|p| p.parent())
            .map(|dir| dir.join("nsec"))
            .unwrap_or_else(get_nsec_path)
    }

    fn load_config(&self) -> Result<Config> {
        let mut config = Config::load_from(&self.config_path())?;
        if !self.relays.is_empty() {
            config.nostr.relays = self.relays.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nostr_call=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Keygen { force } => {
            let path = cli.nsec_path();
            let (identity, created) = if *force {
                (write_nsec_at(&path, Keys::generate())?, true)
            } else {
                ensure_nsec_at(&path)?
            };
            if created {
                println!("Identity: {} (new)", identity.display());
            } else {
                println!("Identity: {}", identity.display());
            }
            println!("Secret key stored in {}", path.display());
        }
        Commands::Whoami => {
            let (identity, _) = ensure_nsec_at(&cli.nsec_path())?;
            println!("npub: {}", identity.display());
            println!("hex:  {}", identity.routing_key().to_hex());
        }
        Commands::Listen => {
            let config = cli.load_config()?;
            let (identity, _) = ensure_nsec_at(&cli.nsec_path())?;
            run_session(config, identity, None).await?;
        }
        Commands::Call { peer } => {
            let remote = PeerDirectory::resolve(peer).context("Invalid peer key")?;
            let config = cli.load_config()?;
            let (identity, _) = ensure_nsec_at(&cli.nsec_path())?;
            run_session(config, identity, Some(remote)).await?;
        }
    }

    Ok(())
}

async fn run_session(config: Config, identity: Identity, remote: Option<PublicKey>) -> Result<()> {
    let settings = config.session_settings()?;
    let pool = RelayPool::new(
        WebSocketRelayClient::new(config.publish_timeout()),
        config.nostr.relays.clone(),
    );
    let backend = RtcBackend::new(config.webrtc.stun_servers.clone());

    println!("Identity: {}", identity.display());
    println!("Relays: {}", config.nostr.relays.join(", "));

    let (context, handle, mut events) = SessionContext::new(identity, pool, backend, settings);
    let session = tokio::spawn(context.run());

    if let Some(remote) = remote {
        println!("Calling {}", PeerDirectory::present(&remote));
        // Failures are reported on the event stream as well
        let _ = handle.call(remote).await;
    }
    println!("Commands: retry, hangup, state, quit (Ctrl-C to exit)");

    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    console(
        BufReader::new(tokio::io::stdin()),
        &mut events,
        interrupt,
        |line| {
            let handle = handle.clone();
            async move { run_command(&handle, line.trim()).await }
        },
        print_event,
    )
    .await;

    handle.shutdown();
    session.await.context("Session task failed")??;
    Ok(())
}

#[derive(Debug, PartialEq)]
enum ConsoleExit {
    Interrupted,
    Quit,
    SessionEnded,
}

/// Feed input lines to `command` and session events to `show`. Closed
/// input only stops reading; events keep flowing until interrupted.
async fn console<R, I, C, F>(
    input: R,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    interrupt: I,
    mut command: C,
    mut show: impl FnMut(&SessionEvent),
) -> ConsoleExit
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
    C: FnMut(String) -> F,
    F: Future<Output = bool>,
{
    tokio::pin!(interrupt);
    let mut lines = input.lines();
    let mut input_open = true;
    loop {
        tokio::select! {
            _ = &mut interrupt => return ConsoleExit::Interrupted,
            event = events.recv() => match event {
                Some(event) => show(&event),
                None => return ConsoleExit::SessionEnded,
            },
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => {
                    if !command(line).await {
                        return ConsoleExit::Quit;
                    }
                }
                Ok(None) | Err(_) => input_open = false,
            },
        }
    }
}

/// Returns false when the user asked to quit
async fn run_command(handle: &SessionHandle, command: &str) -> bool {
    let result = match command {
        "" => return true,
        "quit" | "exit" => return false,
        "retry" => handle.retry().await,
        "hangup" => handle.hangup().await,
        "state" => handle.state().await.map(|state| println!("State: {}", state)),
        other => {
            println!("Unknown command: {}", other);
            return true;
        }
    };
    if let Err(e) = result {
        println!("{}", e);
    }
    true
}

fn print_event(event: &SessionEvent) {
    let line = match event {
        SessionEvent::StateChanged(state) => format!("state -> {}", state),
        SessionEvent::IncomingCall { from } => {
            format!("incoming call from {}", PeerDirectory::present(from))
        }
        SessionEvent::SignalSent { payload_type, to } => {
            format!("sent {} to {}", payload_type, PeerDirectory::present(to))
        }
        SessionEvent::RemoteTrack { kind, id } => format!("remote {} track {}", kind, id),
        SessionEvent::ConnectionState(state) => format!("connection {}", state),
        SessionEvent::SyncComplete { relay } => format!("synced with {}", relay),
        SessionEvent::SignalRejected(reason) => format!("rejected signal: {}", reason),
        SessionEvent::Error(message) => format!("error: {}", message),
    };
    println!("[{}] {}", Timestamp::now().to_human_datetime(), line);
}
