#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::http::{HealthState, spawn_http_server};
use crate::server::registry::{RegistryConfig, RoomRegistry};
use crate::server::router::{MessageRouter, RouterConfig};
use crate::server::store::{InMemoryStore, MessageStore, SqlStore};

struct Args {
	bind: SocketAddr,
	config_path: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--bind quic://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: quic://127.0.0.1:18203)\n\
\t          Format: [quic://]ip:port\n\
\t--config   Config file (default: ~/.relay/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_bind(v: &str) -> Result<SocketAddr, String> {
	let v = v.trim();
	let addr = v.strip_prefix("quic://").unwrap_or(v);
	addr.parse::<SocketAddr>()
		.map_err(|e| format!("invalid bind address {v:?} (expected quic://ip:port): {e}"))
}

fn parse_args() -> Args {
	let mut bind_endpoint = "quic://127.0.0.1:18203".to_string();
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = parse_bind(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind, config_path }
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relay_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let relay_cfg = crate::config::load_relay_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded relay config (toml + env overrides)");

	init_metrics(relay_cfg.server.metrics_bind.as_deref());

	let store: Arc<dyn MessageStore> = match relay_cfg.persistence.database_url.as_deref() {
		Some(url) => Arc::new(SqlStore::connect(url).await?),
		None => {
			warn!("no database_url configured; messages are kept in memory and lost on restart");
			Arc::new(InMemoryStore::new())
		}
	};

	let registry = RoomRegistry::new(RegistryConfig::default());
	let router = Arc::new(MessageRouter::new(
		store,
		registry,
		RouterConfig {
			store_timeout: relay_cfg.persistence.store_timeout,
			..RouterConfig::default()
		},
	));

	let health_state = HealthState::new();
	if let Some(bind) = relay_cfg.server.http_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_http_server(addr, health_state.clone(), Arc::clone(&router));
				info!(%addr, "http server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid http bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(args.bind);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		relay_cfg.server.tls_cert_path.as_deref(),
		relay_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind,
			cert_der_len = server_cert_der.len(),
			"relay_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings {
		auth_token: relay_cfg.auth_token.clone(),
		auth_hmac_secret: relay_cfg.server.auth_hmac_secret.clone(),
		subscriber_queue_capacity: relay_cfg.server.subscriber_queue_capacity,
		send_rate_limit_burst: relay_cfg.server.send_rate_limit_burst,
		send_rate_limit_per_minute: relay_cfg.server.send_rate_limit_per_minute,
		join_policy: relay_cfg.server.room_join_policy,
		..ConnectionSettings::default()
	};

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let connecting = tokio::select! {
			incoming = endpoint.accept() => match incoming {
				Some(incoming) => incoming,
				None => break,
			},
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown requested");
				break;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("relay_server_connections_total").increment(1);

		let router = Arc::clone(&router);
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, router, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	endpoint.close(0u32.into(), b"server shutdown");
	endpoint.wait_idle().await;

	Ok(())
}
