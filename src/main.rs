use axum::{routing::get, Router};
use futures_util::StreamExt;
use rdkafka::{consumer::Consumer, Message as KafkaMessage};
use tracing::{error, info, warn};

use perp_engine::config::{Config, FeeSchedule};
use perp_engine::events::{InboundEnvelope, TOPIC_ORDER_UPDATE};
use perp_engine::{db, kafka, Clock, Engine, EngineError, EventPublisher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perp_engine=info".into()),
        )
        .init();

    info!("Starting matching engine...");

    let config = Config::from_env();
    let fees = FeeSchedule::from_env()?;
    if config.testnet {
        info!("Running in TESTNET mode");
    }

    info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let producer = kafka::create_producer(&config.kafka_brokers)?;
    let publisher = EventPublisher::new(
        producer,
        config.match_topic.clone(),
        config.publish_topic.clone(),
        Clock,
    );
    let engine = Engine::new(pool.clone(), fees, Clock);

    tokio::spawn(run_match_consumer(config.clone(), engine, publisher));

    let app = Router::new().route("/health", get(health));
    info!("Matching engine listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// Consume the match queue with a reconnect loop. Events on a symbol arrive
/// on one partition, so processing messages in order serializes the symbol.
async fn run_match_consumer(config: Config, mut engine: Engine, publisher: EventPublisher) {
    loop {
        info!("Connecting to Kafka consumer...");
        let consumer = match kafka::create_consumer(&config.kafka_brokers, &config.consumer_group) {
            Ok(consumer) => consumer,
            Err(err) => {
                error!("Failed to create Kafka consumer: {}, retrying in 3s...", err);
                tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
                continue;
            }
        };

        if let Err(err) = consumer.subscribe(&[&config.match_topic]) {
            error!("Failed to subscribe to topic: {}, retrying in 3s...", err);
            tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
            continue;
        }
        info!("Subscribed to match queue: {}", config.match_topic);

        let mut stream = consumer.stream();
        loop {
            match stream.next().await {
                Some(Ok(message)) => {
                    let Some(payload) = message.payload() else {
                        continue;
                    };
                    let envelope = match serde_json::from_slice::<InboundEnvelope>(payload) {
                        Ok(envelope) if envelope.topic == TOPIC_ORDER_UPDATE => envelope,
                        Ok(_) => continue,
                        Err(err) => {
                            error!("Failed to deserialize order event: {}", err);
                            continue;
                        }
                    };
                    match engine.handle_order_event(&envelope.event).await {
                        Ok(batch) => {
                            if let Err(err) = publisher.publish_batch(&batch).await {
                                error!("Failed to publish event batch: {}", err);
                            }
                        }
                        Err(EngineError::NotFound(what)) => {
                            warn!("Discarding event for missing {}", what);
                        }
                        Err(EngineError::Conflict) => {
                            warn!(order_id = %envelope.event.id, "Lock conflict, re-queueing event");
                            if let Err(err) = publisher.requeue(message.key(), payload).await {
                                error!("Failed to re-queue event: {}", err);
                            }
                        }
                        Err(err @ EngineError::InvariantViolation(_)) => {
                            // Operator intervention required; stop consuming.
                            error!("Halting matching: {}", err);
                            return;
                        }
                        Err(err) => {
                            error!(order_id = %envelope.event.id, "Engine error: {}", err);
                        }
                    }
                }
                Some(Err(err)) => {
                    error!("Kafka consumer error: {}", err);
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
                None => {
                    error!("Kafka stream ended, reconnecting...");
                    break;
                }
            }
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
    }
}
