//! CLI for nqueue
//!
//! Subcommands:
//! - `run`: start a broker from the loaded configuration and log its stats
//!   until Ctrl-C
//! - `demo`: publish and consume a batch of messages in-process (useful for
//!   smoke tests)

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;
use nqueue::broker::{Broker, BrokerConfig, CategoryConfig};
use nqueue::client::{ConsumerConfig, HandlerError, Message, ProducerConfig, StringCodec};
use nqueue::config::load_config;
use nqueue::utils::logging;
use tracing::{info, warn};

const DEMO_CATEGORY: &str = "demo";

#[derive(Parser)]
#[command(name = "nqueue")]
enum Command {
    /// Run a broker until interrupted
    Run {
        /// How often to log broker stats, in seconds
        #[arg(long, default_value_t = 10)]
        stats_interval: u64,
    },
    /// Publish messages through a producer and consume them with one group
    Demo {
        #[arg(long, default_value_t = 100)]
        messages: usize,
        #[arg(long, default_value_t = 3)]
        queues: usize,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let result = match cmd {
        Command::Run { stats_interval } => run(Duration::from_secs(stats_interval.max(1))).await,
        Command::Demo { messages, queues } => demo(messages, queues).await,
    };
    if let Err(e) = result {
        // logging may not be initialised yet if config loading failed
        eprintln!("nqueue failed: {e}");
        std::process::exit(1);
    }
}

async fn run(stats_interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config()?;
    logging::init(&settings.logging.level);

    let broker = Broker::from_settings(&settings);
    info!(
        overrides = settings.categories.len(),
        "broker started, press Ctrl-C to stop"
    );

    let mut ticker = tokio::time::interval(stats_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = broker.get_stats();
                info!(
                    categories = stats.category_count,
                    messages = stats.total_messages,
                    bytes = stats.total_bytes,
                    consumers = stats.total_consumers,
                    "broker stats"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }

    broker.shutdown().await;
    Ok(())
}

async fn demo(messages: usize, queues: usize) -> Result<(), Box<dyn std::error::Error>> {
    logging::init("info");

    let broker = Broker::new(BrokerConfig {
        rebalance_debounce: Duration::from_millis(50),
        ..BrokerConfig::default()
    });
    broker.get_or_create_category(DEMO_CATEGORY, CategoryConfig::with_queues(queues))?;

    let delivered = Arc::new(AtomicUsize::new(0));
    let consumer = broker.create_consumer(
        ConsumerConfig::new("demo-consumer", "demo-group").poll_interval(Duration::from_millis(20)),
        StringCodec,
    );
    let counter = delivered.clone();
    consumer.subscribe(DEMO_CATEGORY, move |_msg: Message<String>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    })?;

    let producer = broker.create_producer(ProducerConfig::new("demo-producer"), StringCodec);
    for i in 0..messages {
        let key = format!("key-{}", i % 10);
        producer
            .send(DEMO_CATEGORY, Some(&key), &format!("message {i}"), None)
            .await?;
    }
    producer.close();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while delivered.load(Ordering::SeqCst) < messages && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    consumer.close().await;
    let count = delivered.load(Ordering::SeqCst);
    if count < messages {
        warn!(delivered = count, expected = messages, "demo timed out");
    }
    for lag in broker.consumer_lag(DEMO_CATEGORY, "demo-group")? {
        info!(queue = lag.queue, next = lag.next_offset, lag = lag.lag, "queue progress");
    }
    println!("delivered {count}/{messages} messages");

    broker.shutdown().await;
    Ok(())
}
