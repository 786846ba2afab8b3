pub mod connection;
pub mod message;
pub mod persistence;
pub mod transport;

use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::connection::{ConnectionHandle, ConnectionState, ManagerSettings, PublishOptions};
use crate::message::HandlerRegistry;
use crate::persistence::config_portal::ConfigPortal;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let portal = setup_config().await?;
    let config = portal.snapshot().await;

    if config.broker.url.is_empty() {
        return Err(eyre!(
            "No broker endpoint configured, set broker.url in the config file"
        ));
    }

    info!(
        "Starting chatlink for room {} on {}",
        config.chat.room, config.broker.url
    );

    // Inbound chat messages flow from the handler into the terminal loop
    let (message_tx, mut message_rx) = mpsc::channel(100);
    let handlers = HandlerRegistry::new()
        .on_any(Box::new(|msg| {
            debug!("Message on {} ({} bytes)", msg.topic, msg.payload.len());
        }))
        .on_topic(
            config.chat.room.clone(),
            Box::new(move |msg| {
                if message_tx.try_send(msg.clone()).is_err() {
                    warn!("Dropping inbound message, display queue is full");
                }
            }),
        );

    let settings = ManagerSettings {
        endpoint: config.broker.url.clone(),
        options: config.link_options(),
        auto_connect: config.link.auto_connect,
        handlers,
    };
    let handle = ConnectionHandle::spawn(settings);

    // Mirror state transitions into the log output
    let mut transitions = handle.status_receiver();
    tokio::spawn(async move {
        let mut last_state = transitions.borrow().state;
        while transitions.changed().await.is_ok() {
            let status = transitions.borrow().clone();
            if status.state != last_state {
                info!("Broker link is now {}", status.state);
                if let Some(error) = &status.last_error {
                    warn!("Last connection error: {}", error);
                }
                last_state = status.state;
            }
        }
    });

    if !config.link.auto_connect {
        handle
            .connect(config.broker.url.as_str(), config.link_options())
            .await
            .map_err(|e| eyre!("Failed to issue connect request: {}", e))?;
    }

    info!("Waiting for broker connection");
    let mut status = handle.status_receiver();
    status
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .map_err(|_| eyre!("Connection manager stopped before connecting"))?;

    match handle
        .subscribe(config.chat.room.as_str(), config.subscribe_qos())
        .await
    {
        Ok(grant) => info!("Joined {} at {:?}", grant.topic, grant.qos),
        Err(e) => error!("Could not join {}: {}", config.chat.room, e),
    }

    println!(
        "Connected to {}. Type a message and press enter, /quit to leave.",
        config.broker.url
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(message) = message_rx.recv() => {
                println!("[{}] {}", message.topic, message.text());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "/quit" {
                        break;
                    }
                    let outgoing = format!("{}: {}", config.chat.display_name, line);
                    if let Err(e) = handle
                        .publish(config.chat.room.as_str(), outgoing, PublishOptions::default())
                        .await
                    {
                        error!("Publish failed: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            }
        }
    }

    info!("Leaving {}", config.chat.room);
    handle.shutdown().await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn setup_config() -> Result<ConfigPortal> {
    ConfigPortal::ensure_default_config().await?;
    ConfigPortal::load().await
}
