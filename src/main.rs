//! softcascade - deletion-event listener service
//!
//! Applies foreign-key cascades to local data when other services announce
//! deletions, and announces its own cascades in turn.

use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use softcascade::{
    broker::{BrokerListener, BrokerPublisher, NatsClient},
    capture::ChangeCapture,
    config::{Args, CollectionPolicySpec, Transport},
    engine::{CascadeEngine, ExecutionStrategy},
    events::{DeletionPublisher, InProcessBus},
    policy::PolicyRegistry,
    store::{MemoryStore, MongoStore, Store},
    subscriptions::{InProcessListener, SubscriptionRegistry},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("softcascade={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  softcascade deletion listener");
    info!("======================================");
    info!("Service: {}", args.service_name);
    info!("Transport: {:?}", args.transport);
    info!("Exchange: {} (queue {})", args.exchange, args.queue());
    info!("Restore propagation: {}", args.propagate_restores);
    for spec in &args.collection_policies {
        info!("  policy: {} > {} via {}", spec.parent_type, spec.child_type, spec.foreign_key);
    }
    for spec in &args.cascade_subscriptions {
        info!("  subscription: {} -> {}.{}", spec.topic, spec.local_type, spec.foreign_key);
    }
    info!("======================================");

    let policies = build_policies(&args.collection_policies);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tasks = match args.transport {
        Transport::Memory => start_in_memory(&args, policies, shutdown_rx),
        Transport::Nats => start_nats(&args, policies, shutdown_rx).await?,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Listener task ended abnormally: {}", e);
        }
    }

    info!("softcascade stopped");
    Ok(())
}

fn build_policies(specs: &[CollectionPolicySpec]) -> Arc<PolicyRegistry> {
    specs
        .iter()
        .fold(PolicyRegistry::builder(), |builder, spec| {
            builder.register_collection_by_name(&spec.parent_type, &spec.child_type, &spec.foreign_key)
        })
        .build()
}

fn build_engine(
    args: &Args,
    store: Arc<dyn Store>,
    policies: Arc<PolicyRegistry>,
    publisher: Arc<dyn DeletionPublisher>,
) -> Arc<CascadeEngine> {
    let capture = Arc::new(ChangeCapture::new(args.capture_config(), publisher));
    Arc::new(
        CascadeEngine::new(store, policies)
            .with_interceptor(capture)
            .with_strategy(ExecutionStrategy::new(args.retry_config())),
    )
}

fn build_subscriptions(args: &Args, engine: &Arc<CascadeEngine>) -> Arc<SubscriptionRegistry> {
    let mut registry = SubscriptionRegistry::new().with_restores(args.propagate_restores);
    for spec in &args.cascade_subscriptions {
        registry.subscribe_foreign_key_by_name(
            &spec.topic,
            &spec.local_type,
            &spec.foreign_key,
            engine.clone(),
        );
    }
    Arc::new(registry)
}

fn start_in_memory(
    args: &Args,
    policies: Arc<PolicyRegistry>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    warn!("Memory transport is a smoke-test mode: the store starts empty and only this process publishes");

    let bus = Arc::new(InProcessBus::default());
    let engine = build_engine(args, Arc::new(MemoryStore::new()), policies, bus.clone());
    let registry = build_subscriptions(args, &engine);

    InProcessListener::new(registry, bus).start(shutdown)
}

async fn start_nats(
    args: &Args,
    policies: Arc<PolicyRegistry>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let store = match MongoStore::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(store) => store,
        Err(e) => {
            error!("MongoDB connection failed: {}", e);
            std::process::exit(1);
        }
    };

    for spec in &args.collection_policies {
        store.ensure_index(&spec.child_type, &spec.foreign_key).await?;
    }
    for spec in &args.cascade_subscriptions {
        store.ensure_index(&spec.local_type, &spec.foreign_key).await?;
    }

    let broker_config = args.broker_config();
    let nats = NatsClient::connect_with_retry(
        &args.nats,
        &args.service_name,
        broker_config.connect_attempts,
        broker_config.connect_delay,
    )
    .await?;

    let publisher = Arc::new(BrokerPublisher::new(&nats, broker_config.clone()).await?);
    let engine = build_engine(args, Arc::new(store), policies, publisher);
    let registry = build_subscriptions(args, &engine);

    let listener = BrokerListener::new(&nats, registry, broker_config);
    let task = tokio::spawn(async move {
        if let Err(e) = listener.run(shutdown).await {
            error!("Deletion listener failed: {}", e);
        }
    });

    Ok(vec![task])
}
