//! Headless bot that joins a session and random-walks, for load and smoke tests.

use clap::Parser;
use futures::{SinkExt, StreamExt};
use log::{error, info, warn};
use rand::Rng;
use shared::{current_timestamp, ClientMessage, ServerMessage, Transform, UpdatePayload};
use std::time::Duration;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Updates sent per second
    #[arg(short, long, default_value = "10")]
    rate: u32,

    /// Distance moved per update
    #[arg(long, default_value = "0.5")]
    step: f32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (ws_stream, _) = connect_async(args.server.as_str()).await?;
    info!("Connected to {}", args.server);
    let (mut sink, mut source) = ws_stream.split();

    let mut transform = Transform::default();
    let mut send_interval = interval(Duration::from_millis(1000 / args.rate.max(1) as u64));

    loop {
        tokio::select! {
            incoming = source.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        info!("Server closed connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Connection error: {}", e);
                        break;
                    }
                    None => break,
                };

                match ServerMessage::decode(text.as_str()) {
                    Ok(ServerMessage::Welcome(welcome)) => {
                        info!("Joined as {} with {} other players", welcome.self_id, welcome.snapshot.len());
                    }
                    Ok(ServerMessage::PlayerJoined(state)) => info!("Player {} joined", state.id),
                    Ok(ServerMessage::PlayerLeft(left)) => info!("Player {} left", left.id),
                    Ok(ServerMessage::StateUpdate(states)) => {
                        log::debug!("State update for {} players", states.len());
                    }
                    Ok(ServerMessage::Snapshot(states)) => info!("Snapshot of {} players", states.len()),
                    Ok(ServerMessage::Disconnected { reason }) => {
                        warn!("Disconnected by server: {}", reason);
                        break;
                    }
                    Err(e) => warn!("Unreadable server message: {}", e),
                }
            }
            _ = send_interval.tick() => {
                {
                    let mut rng = rand::thread_rng();
                    transform.position[0] += rng.gen_range(-args.step..=args.step);
                    transform.position[2] += rng.gen_range(-args.step..=args.step);
                }

                let update = ClientMessage::Update(UpdatePayload {
                    transform: transform.clone(),
                    timestamp: current_timestamp(),
                    attributes: None,
                });
                sink.send(Message::text(update.encode()?)).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Leaving session");
                sink.send(Message::Close(None)).await?;
                break;
            }
        }
    }

    Ok(())
}
