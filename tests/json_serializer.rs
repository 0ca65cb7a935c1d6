//! The facade with the JSON serializer instead of bincode.
#![cfg(feature = "json")]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::timeout};
use typed_pubsub::{
	BusMessage, ConnectionConfig, DeliveryMode, InMemoryBroker, JsonSerializer,
	MessageSerializer, PubSub,
};

#[derive(BusMessage, Serialize, Deserialize, Debug, Clone, PartialEq)]
struct SensorReading {
	sensor_id: String,
	temperature: f64,
}

#[tokio::test]
async fn json_payloads_round_trip_through_the_broker() {
	let broker = InMemoryBroker::new();
	let bus: PubSub<JsonSerializer> = PubSub::setup(
		ConnectionConfig::new("json-ns", "owner", "secret"),
		broker.clone(),
	);
	let (tx, mut rx) = mpsc::unbounded_channel();

	let reading = SensorReading {
		sensor_id: "kitchen".to_string(),
		temperature: 21.5,
	};
	bus.subscribe(
		move |msg: SensorReading| {
			let _ = tx.send(msg);
		},
		DeliveryMode::PeekLock,
	)
	.await
	.unwrap()
	.publish(&reading)
	.await
	.unwrap();

	let received = timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("timed out")
		.expect("channel closed");
	assert_eq!(received, reading);
	bus.close().await.unwrap();
}

#[test]
fn json_body_is_readable_by_other_consumers() {
	let bytes = MessageSerializer::<SensorReading>::serialize(
		&JsonSerializer,
		&SensorReading {
			sensor_id: "hall".to_string(),
			temperature: 19.0,
		},
	)
	.unwrap();
	let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
	assert_eq!(value["sensor_id"], "hall");
}
