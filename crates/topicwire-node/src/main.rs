//! topicwire-node binary.
//!
//! Without a real ledger backend wired in, the node runs against the
//! in-memory ledger; `--demo` additionally drives a full two-party
//! handshake and request/response round trip through it, then exits.

use std::sync::Arc;

use clap::Parser;

use topicwire_ledger::{LedgerClient, MemoryLedger};
use topicwire_node::{Config, Node, ResponderHook};
use topicwire_protocol::TopicId;

struct EchoHook;

#[async_trait::async_trait]
impl ResponderHook for EchoHook {
    async fn respond(&self, _topic: &TopicId, prompt: &str) -> Option<String> {
        Some(format!("echo: {prompt}"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "topicwire_node=info".parse().unwrap()),
        )
        .init();

    let config = Config::parse();
    if config.demo {
        return run_demo(config).await;
    }

    let ledger = MemoryLedger::new();
    let mut config = config;
    if config.inbound_topic.is_none() {
        let inbound = ledger.create_topic_sync(&format!("inbound:{}", config.account));
        tracing::info!("Created in-memory inbound topic {inbound}");
        config.inbound_topic = Some(inbound);
    }
    if config.outbound_topic.is_none() {
        let outbound = ledger.create_topic_sync(&format!("outbound:{}", config.account));
        tracing::info!("Created in-memory outbound topic {outbound}");
        config.outbound_topic = Some(outbound);
    }

    let ledger: Arc<dyn LedgerClient> = Arc::new(ledger.with_operator(config.account.clone()));
    let (node, mut app_rx) = Node::new(config, ledger, Some(Arc::new(EchoHook)));
    let handle = node.handle();

    tokio::spawn(async move {
        while let Some(msg) = app_rx.recv().await {
            tracing::info!(
                "Inbound message on {} from {}: {}",
                msg.topic,
                msg.sender.as_deref().unwrap_or("<unknown>"),
                msg.data,
            );
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            handle.shutdown();
        }
    });

    node.run().await
}

/// Two nodes on one in-memory ledger: responder accepts and echoes,
/// requester connects, asks, and prints the correlated answer.
async fn run_demo(base: Config) -> anyhow::Result<()> {
    let ledger = MemoryLedger::new();
    let inbound = ledger.create_topic_sync("responder-inbound");
    let outbound = ledger.create_topic_sync("responder-outbound");

    let mut responder_cfg = base.clone();
    responder_cfg.account = "0.0.2002".into();
    responder_cfg.inbound_topic = Some(inbound.clone());
    responder_cfg.outbound_topic = Some(outbound.clone());
    responder_cfg.poll_interval_ms = responder_cfg.poll_interval_ms.min(200);
    responder_cfg.confirmation_delay_ms = responder_cfg.confirmation_delay_ms.min(200);

    let mut requester_cfg = responder_cfg.clone();
    requester_cfg.account = "0.0.1001".into();
    requester_cfg.inbound_topic = None;
    requester_cfg.outbound_topic = None;

    let responder_ledger: Arc<dyn LedgerClient> =
        Arc::new(ledger.with_operator("0.0.2002"));
    let (responder, _responder_app) =
        Node::new(responder_cfg, responder_ledger, Some(Arc::new(EchoHook)));
    let responder_handle = responder.handle();
    tokio::spawn(responder.run());

    let requester_ledger: Arc<dyn LedgerClient> =
        Arc::new(ledger.with_operator("0.0.1001"));
    let (requester, _requester_app) = Node::new(requester_cfg, requester_ledger, None);
    let requester_handle = requester.handle();
    tokio::spawn(requester.run());

    // The request must land after the responder's inbound cursor is
    // initialized, or tip-init would swallow it.
    while !responder_handle.is_monitoring(&inbound) {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let topic = requester_handle
        .connect("0.0.2002", &inbound, &outbound)
        .await?;
    tracing::info!("Demo: connection established on topic {topic}");

    let answer = requester_handle
        .send_request(&topic, "hello over the ledger".into())
        .await?;
    tracing::info!("Demo: correlated response: {answer}");

    requester_handle.close(&topic, "demo finished").await?;
    requester_handle.shutdown();
    responder_handle.shutdown();
    Ok(())
}
