//! Command handlers for the blecast CLI

use std::sync::Arc;
use std::time::Duration;

use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use tracing::{info, warn};

use blecast_ble::{BlecastNode, LoopbackAir, TokioClock};
use blecast_core::{ChannelId, Fragmenter, MessageId, ObservedMessage, ScanFilter};

use crate::cli::{Cli, Commands, PayloadArgs};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Demo {
                payload,
                loss,
                seed,
                timeout,
            } => {
                let mut config = config;
                if let Some(loss) = loss {
                    config.demo.loss_rate = loss;
                }
                if let Some(seed) = seed {
                    config.demo.seed = seed;
                }
                config.validate()?;
                Self::handle_demo_command(config, &payload, Duration::from_secs(timeout)).await
            }
            Commands::Plan {
                payload,
                max_length,
            } => Self::handle_plan_command(&config, &payload, max_length),
            Commands::Channel => {
                println!("{}", ChannelId::generate(config.protocol.channel_marker));
                Ok(())
            }
            Commands::Broadcast { channel, payload } => {
                Self::handle_broadcast_command(config, channel, &payload).await
            }
            Commands::Scan { channel } => Self::handle_scan_command(config, channel).await,
            Commands::Run { channel, payload } => Self::handle_run_command(config, channel, &payload).await,
        }
    }

    /// Two nodes on a simulated air: one sends, the other prints what it hears
    async fn handle_demo_command(config: AppConfig, payload: &PayloadArgs, timeout: Duration) -> Result<()> {
        let payload = parse_payload(payload)?;
        let air = LoopbackAir::with_parts(
            config.demo.loopback(config.protocol.ble_overhead),
            Box::new(ChaCha8Rng::seed_from_u64(config.demo.seed)),
            Arc::new(TokioClock::new()),
        );

        let (sender_radio, receiver_radio) = (air.radio(), air.radio());
        let sender = BlecastNode::new(config.node_config(), sender_radio.clone(), sender_radio)?
            .with_clock(Arc::new(TokioClock::new()))
            .with_id_rng(Box::new(ChaCha8Rng::seed_from_u64(config.demo.seed.wrapping_add(1))));
        let receiver = BlecastNode::new(config.node_config(), receiver_radio.clone(), receiver_radio)?
            .with_clock(Arc::new(TokioClock::new()));

        let channel = ChannelId::generate(config.protocol.channel_marker);
        let mut messages = receiver.subscribe();
        receiver.scan(ScanFilter::channel(channel)).await?;

        let outcome = sender.broadcast(channel, &payload).await?;
        println!(
            "Broadcasting {} bytes on {} as {} packet(s), loss rate {:.0}%",
            payload.len(),
            channel,
            outcome.total_packets(),
            config.demo.loss_rate * 100.0
        );

        let heard = tokio::time::timeout(timeout, messages.recv()).await;
        let result = match heard {
            Ok(Some(message)) => {
                print_message(&message);
                if message.payload() != payload.as_slice() {
                    warn!("Received payload differs from the one sent");
                }
                Ok(())
            }
            Ok(None) => Err(CliError::InvalidInput("message stream closed".into())),
            Err(_) => {
                println!("Nothing received within {:?}", timeout);
                Ok(())
            }
        };

        let ingest = receiver.ingest_stats().await;
        sender.shutdown().await?;
        receiver.shutdown().await?;

        let broadcast = sender.broadcast_stats().await;
        let reassembly = receiver.reassembly_stats();
        println!("\nSender:   {} packets advertised", broadcast.packets_advertised);
        println!(
            "Receiver: {} reports, {} fragments, {} malformed, {} foreign, {} duplicates",
            ingest.events, ingest.fragments, ingest.malformed, ingest.foreign, reassembly.duplicates
        );
        result
    }

    /// Print the packets a message would be split into
    fn handle_plan_command(config: &AppConfig, payload: &PayloadArgs, max_length: usize) -> Result<()> {
        let payload = parse_payload(payload)?;
        let budget = config.protocol.payload_budget(max_length)?;
        let packets = Fragmenter::split_for_air(&payload, budget, MessageId::new(0))?;

        println!(
            "{} bytes, {} payload bytes per advertisement ({} raw - {} overhead)",
            payload.len(),
            budget,
            max_length,
            config.protocol.ble_overhead
        );
        if Fragmenter::is_ambiguous_bare(&payload, budget) {
            println!("note: payload starts like a fragment header, sent fragmented");
        }
        for (index, packet) in packets.iter().enumerate() {
            let kind = if packet.is_fragment() { "fragment" } else { "bare" };
            println!("  [{:>3}] {:<8} {}", index, kind, hex::encode(packet.to_bytes()));
        }
        Ok(())
    }

    #[cfg(feature = "bluez")]
    async fn handle_broadcast_command(
        config: AppConfig,
        channel: Option<String>,
        payload: &PayloadArgs,
    ) -> Result<()> {
        use blecast_ble::{BluezAdvertiser, BtleplugScanner};

        let payload = parse_payload(payload)?;
        let channel = match channel {
            Some(text) => text.parse::<ChannelId>()?,
            None => ChannelId::generate(config.protocol.channel_marker),
        };
        let node = BlecastNode::new(config.node_config(), BluezAdvertiser::new(), BtleplugScanner::new())?;

        let outcome = node.broadcast(channel, &payload).await?;
        println!("Broadcasting on {} ({:?}). Press Ctrl+C to stop...", channel, outcome);
        tokio::signal::ctrl_c().await?;

        node.shutdown().await?;
        info!("Broadcast stopped");
        Ok(())
    }

    #[cfg(feature = "bluez")]
    async fn handle_scan_command(config: AppConfig, channel: Option<String>) -> Result<()> {
        use blecast_ble::{BluezAdvertiser, BtleplugScanner};

        let filter = match channel {
            Some(text) => ScanFilter::channel(text.parse::<ChannelId>()?),
            None => ScanFilter::any(),
        };
        let node = BlecastNode::new(config.node_config(), BluezAdvertiser::new(), BtleplugScanner::new())?;
        let mut messages = node.subscribe();
        node.scan(filter).await?;
        println!("Scanning... Press Ctrl+C to stop");

        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => print_message(&message),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        node.shutdown().await?;
        Ok(())
    }

    #[cfg(feature = "bluez")]
    async fn handle_run_command(config: AppConfig, channel: Option<String>, payload: &PayloadArgs) -> Result<()> {
        use blecast_ble::{BluezAdvertiser, BtleplugScanner};

        let payload = parse_payload(payload)?;
        let channel = match channel {
            Some(text) => text.parse::<ChannelId>()?,
            None => ChannelId::generate(config.protocol.channel_marker),
        };
        let node = BlecastNode::new(config.node_config(), BluezAdvertiser::new(), BtleplugScanner::new())?;
        let mut messages = node.subscribe();
        node.scan(ScanFilter::any()).await?;
        let outcome = node.broadcast(channel, &payload).await?;
        println!("Broadcasting on {} ({:?}) and scanning. Press Ctrl+C to stop...", channel, outcome);

        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => print_message(&message),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        node.shutdown().await?;
        info!("Node stopped");
        Ok(())
    }

    #[cfg(not(feature = "bluez"))]
    async fn handle_run_command(
        _config: AppConfig,
        _channel: Option<String>,
        _payload: &PayloadArgs,
    ) -> Result<()> {
        Err(radio_unavailable())
    }

    #[cfg(not(feature = "bluez"))]
    async fn handle_broadcast_command(
        _config: AppConfig,
        _channel: Option<String>,
        _payload: &PayloadArgs,
    ) -> Result<()> {
        Err(radio_unavailable())
    }

    #[cfg(not(feature = "bluez"))]
    async fn handle_scan_command(_config: AppConfig, _channel: Option<String>) -> Result<()> {
        Err(radio_unavailable())
    }
}

#[cfg(not(feature = "bluez"))]
fn radio_unavailable() -> CliError {
    CliError::FeatureNotAvailable("built without the `bluez` feature; use `demo` instead".into())
}

/// Payload bytes from text or hex arguments
pub fn parse_payload(args: &PayloadArgs) -> Result<Vec<u8>> {
    let payload = match (&args.message, &args.hex) {
        (_, Some(hex)) => hex::decode(hex.trim())?,
        (Some(text), None) => text.as_bytes().to_vec(),
        (None, None) => return Err(CliError::InvalidInput("no message given".into())),
    };
    if payload.is_empty() {
        return Err(CliError::InvalidInput("message is empty".into()));
    }
    Ok(payload)
}

fn print_message(message: &ObservedMessage) {
    let text = String::from_utf8_lossy(message.payload());
    match message {
        ObservedMessage::Single { .. } => println!(
            "[{}] {} dBm  single: {}",
            message.source_address(),
            message.signal_strength(),
            text
        ),
        ObservedMessage::Reassembled {
            fragment_count,
            first_seen_at,
            ..
        } => println!(
            "[{}] {} dBm  reassembled from {} packets in {} ms: {}",
            message.source_address(),
            message.signal_strength(),
            fragment_count,
            message.timestamp() - *first_seen_at,
            text
        ),
    }
}
