use bincode::{Decode, Encode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{
	EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};
use typed_pubsub::{
	BusMessage, ConnectionConfig, DeliveryMode, InMemoryBroker, PubSub,
};
use uuid::Uuid;

/// Selects the broker backend when built with the `mqtt` feature.
const BACKEND_ENV: &str = "PUBSUB_BACKEND";

#[derive(BusMessage, Encode, Decode, Debug)]
struct SimpleMessage {
	title: String,
	id: u128,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	dotenv::dotenv().ok();
	init_tracing();

	let config = ConnectionConfig::from_env().unwrap_or_else(|err| {
		warn!(error = %err, "No broker configured, using a local namespace");
		ConnectionConfig::new("local", "console", "")
	});
	let bus = build_bus(config);

	bus.on_error(|err| eprintln!("Subscription error: {err}"));
	bus.clear_topics()
		.await?
		.subscribe(
			|msg: SimpleMessage| {
				println!("Received '{}' (id {:032x})", msg.title, msg.id)
			},
			DeliveryMode::AutoDelete,
		)
		.await?;

	println!("Type a message and press Enter to publish it. Empty line quits.");
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await? {
		if line.is_empty() {
			break;
		}
		let message = SimpleMessage {
			title: line,
			id: Uuid::new_v4().as_u128(),
		};
		if let Err(err) = bus.publish(&message).await {
			eprintln!("Publish failed: {err}");
		}
	}

	bus.close().await?;
	info!("Console finished");
	Ok(())
}

/// Silent unless `RUST_LOG` is set.
fn init_tracing() {
	if std::env::var("RUST_LOG").is_err() {
		return;
	}
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_target(true).compact())
		.init();
}

fn build_bus(config: ConnectionConfig) -> PubSub {
	let backend = std::env::var(BACKEND_ENV).unwrap_or_default();
	match backend.as_str() {
		#[cfg(feature = "mqtt")]
		| "mqtt" => {
			info!(namespace = %config.namespace, "Using MQTT backend");
			PubSub::setup(config, typed_pubsub::broker::mqtt::MqttConnector::new())
		}
		| "" | "memory" => {
			info!("Using in-memory backend");
			PubSub::setup(config, InMemoryBroker::new())
		}
		| other => {
			warn!(backend = other, "Unknown backend, using in-memory broker");
			PubSub::setup(config, InMemoryBroker::new())
		}
	}
}
