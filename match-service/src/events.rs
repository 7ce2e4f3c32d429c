// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::time::Duration;

use anyhow::Context;
use connect4_common::GameEvent;
use rdkafka::{
    config::ClientConfig,
    producer::{FutureProducer, FutureRecord},
};
use tracing::{debug, warn};

/// Fire-and-forget sink for game lifecycle events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: GameEvent);
}

#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventPublisher {
    pub fn from_env() -> anyhow::Result<Self> {
        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .ok()
            .unwrap_or_else(|| "kafka:9092".to_string());
        let topic = std::env::var("GAME_EVENTS_TOPIC")
            .ok()
            .unwrap_or_else(|| "game-events".to_string());
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to create Kafka game-event producer")?;
        Ok(Self { producer, topic })
    }
}

impl EventPublisher for KafkaEventPublisher {
    fn publish(&self, event: GameEvent) {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        tokio::spawn(async move {
            match send_event(&producer, &topic, &event).await {
                Ok(()) => debug!(
                    game_id = %event.game_id,
                    event_type = ?event.event_type,
                    "published game event"
                ),
                Err(error) => warn!(
                    game_id = %event.game_id,
                    event_type = ?event.event_type,
                    error = %error,
                    "failed to publish game event"
                ),
            }
        });
    }
}

async fn send_event(producer: &FutureProducer, topic: &str, event: &GameEvent) -> anyhow::Result<()> {
    let payload = serde_json::to_string(event).context("failed to encode game event")?;
    producer
        .send(
            FutureRecord::to(topic).key(&event.game_id).payload(&payload),
            Duration::from_secs(5),
        )
        .await
        .map_err(|(error, _)| anyhow::anyhow!("Kafka publish failed: {error:?}"))?;
    Ok(())
}
