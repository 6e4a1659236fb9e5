#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use relay_client::{ClientConfig, RelayEvent, SessionControl};
use tracing::warn;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_client [options] <command>\n\
\n\
Commands:\n\
\tsend (--peer ID | --room ID) TEXT     Send one message\n\
\tlisten (--peer ID | --room ID)...     Join and print events until interrupted\n\
\thistory (--peer ID | --room ID) [--limit N]\n\
\tping\n\
\n\
Options:\n\
\t--server     Server endpoint (default: quic://127.0.0.1:18203)\n\
\t--identity   Identity presented in Hello\n\
\t--token      Auth token (or RELAY_AUTH_TOKEN)\n\
\t--help       Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Clone)]
enum Target {
	Peer(String),
	Room(String),
}

enum Command {
	Send { target: Target, text: String },
	Listen { targets: Vec<Target> },
	History { target: Target, limit: u32 },
	Ping,
}

struct Args {
	cfg: ClientConfig,
	command: Command,
}

fn parse_args() -> Args {
	let mut cfg = ClientConfig::default();
	let mut command_name: Option<String> = None;
	let mut targets = Vec::new();
	let mut limit = 0u32;
	let mut rest = Vec::new();

	cfg.auth_token = std::env::var("RELAY_AUTH_TOKEN").ok().filter(|v| !v.trim().is_empty());

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || it.next().unwrap_or_else(|| usage_and_exit());
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--server" => {
				let endpoint = value();
				cfg = ClientConfig {
					auth_token: cfg.auth_token.take(),
					identity: cfg.identity.take(),
					..ClientConfig::from_quic_endpoint(&endpoint).unwrap_or_else(|e| {
						eprintln!("{e}");
						usage_and_exit();
					})
				};
			}
			"--identity" => cfg.identity = Some(value()),
			"--token" => cfg.auth_token = Some(value()),
			"--peer" => targets.push(Target::Peer(value())),
			"--room" => targets.push(Target::Room(value())),
			"--limit" => {
				limit = value().parse().unwrap_or_else(|_| {
					eprintln!("--limit expects a non-negative integer");
					usage_and_exit();
				});
			}
			other if other.starts_with("--") => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
			_ if command_name.is_none() => command_name = Some(arg),
			_ => rest.push(arg),
		}
	}

	let single_target = |targets: &[Target]| match targets {
		[t] => t.clone(),
		_ => {
			eprintln!("exactly one of --peer/--room is required");
			usage_and_exit();
		}
	};

	let command = match command_name.as_deref() {
		Some("send") => {
			if rest.is_empty() {
				eprintln!("send requires a message text");
				usage_and_exit();
			}
			Command::Send {
				target: single_target(&targets),
				text: rest.join(" "),
			}
		}
		Some("listen") if !targets.is_empty() => Command::Listen { targets },
		Some("history") => Command::History {
			target: single_target(&targets),
			limit,
		},
		Some("ping") => Command::Ping,
		_ => usage_and_exit(),
	};

	Args { cfg, command }
}

fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
		)
		.with_target(false)
		.init();

	let Args { cfg, command } = parse_args();
	let (mut control, welcome) = SessionControl::connect(cfg).await?;
	eprintln!("connected as {} (session {})", welcome.identity, welcome.session_id);

	match command {
		Command::Send { target, text } => {
			let msg = match &target {
				Target::Peer(peer) => control.send_direct(peer, &text).await?,
				Target::Room(room) => control.send_room(room, &text).await?,
			};
			println!("{} {}", msg.id, msg.created_at_ms);
		}
		Command::History { target, limit } => {
			let messages = match &target {
				Target::Peer(peer) => control.history_direct(peer, limit).await?,
				Target::Room(room) => control.history_room(room, limit).await?,
			};
			for m in messages {
				println!("[{}] {}: {}", m.created_at_ms, m.sender, m.body);
			}
		}
		Command::Ping => {
			let pong = control.ping(now_ms()).await?;
			println!("rtt {} ms", now_ms() - pong.client_time_unix_ms);
		}
		Command::Listen { targets } => {
			for target in &targets {
				let room_key = match target {
					Target::Peer(peer) => control.join_peer(peer).await?,
					Target::Room(room) => control.join_room(room).await?,
				};
				eprintln!("joined {room_key}");
			}

			let mut events = control.open_events().await?;
			let listen = events.run_events_loop(|ev| match RelayEvent::try_from(ev) {
				Ok(RelayEvent::Chat { room_key, message }) => {
					println!("{room_key} [{}] {}: {}", message.created_at_ms, message.sender, message.body);
				}
				Ok(RelayEvent::PeerJoined { room_key, identity }) => println!("{room_key} + {identity}"),
				Ok(RelayEvent::PeerLeft { room_key, identity }) => println!("{room_key} - {identity}"),
				Err(e) => warn!(error = %e, "undecodable event"),
			});

			tokio::select! {
				res = listen => res?,
				_ = tokio::signal::ctrl_c() => {}
			}
		}
	}

	control.close(0, "bye");
	Ok(())
}
