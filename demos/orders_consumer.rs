use rabbit_listener::{
    AckMode, AmqpBroker, BoxError, Channel, ConnectionSpec, Consumer, Json, JsonDecoder,
    ListenerConfig, ListenerSet, Properties,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// 1. Define your message structs
#[derive(Deserialize, Debug, Clone)]
struct Order {
    id: u32,
    content: String,
}

#[derive(Serialize, Debug)]
struct Receipt {
    order_id: u32,
    accepted: bool,
}

// 2. Write handlers; the arguments decide what each one receives
async fn on_order(Json(order): Json<Order>) -> Result<Json<Receipt>, BoxError> {
    log::info!("Received order with ID: {}. Content: '{}'", order.id, order.content);

    if order.id == 99 {
        log::info!("Simulating a long-running task...");
        tokio::time::sleep(Duration::from_secs(10)).await;
        log::info!("Long-running task finished.");
    }

    if order.id % 2 != 0 {
        return Err(format!("Failed to process order with odd ID: {}", order.id).into());
    }

    Ok(Json(Receipt {
        order_id: order.id,
        accepted: true,
    }))
}

async fn on_audit(channel: Channel, properties: Properties, body: String) -> Result<(), BoxError> {
    log::info!(
        "Audit event ({}): {}",
        properties.content_type.as_deref().unwrap_or("unknown"),
        body
    );
    channel.ack().await?;
    Ok(())
}

// 3. Register and run
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let spec = match ConnectionSpec::from_env() {
        Ok(spec) => spec,
        Err(_) => ConnectionSpec::builder("localhost").build()?,
    };
    log::info!("Using RabbitMQ at {}", spec.display_addr());

    let mut consumer = Consumer::new(spec, AmqpBroker::new());
    consumer.listen(
        ListenerConfig::builder("orders", on_order)
            .workers(2)
            .decoder(JsonDecoder)
            .prefetch_count(5)
            .reply_queue("orders.receipts")
            .build()?,
    );

    let mut audit = ListenerSet::new();
    audit.listen(
        ListenerConfig::builder("audit", on_audit)
            .workers(1)
            .ack_mode(AckMode::Manual)
            .build()?,
    );
    consumer.add(audit);

    // Blocks until Ctrl+C (or SIGTERM), then stops every worker.
    consumer.start(true).await?;

    log::info!("Application has shut down.");
    Ok(())
}
