use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use callfx_common::config::ConfigStore;
use callfx_common::ParticipantId;
use callfx_session::{
    spawn_negotiator, CallEvent, DummyTransportFactory, EndReason, MemorySignalingChannel,
    NegotiatorConfig, NegotiatorHandle, RelaySignalingChannel, SessionNegotiator, SessionState,
    SignalingChannel, TransportFactory,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use crate::feed::{LocalVideo, TestPattern, DEFAULT_FPS, DEFAULT_HEIGHT, DEFAULT_WIDTH};

const DEMO_TIMEOUT: Duration = Duration::from_secs(10);
const DEMO_FRAMES: usize = 5;

pub fn describe(event: &CallEvent) -> String {
    match event {
        CallEvent::Outgoing { peer } => format!("calling {}", peer),
        CallEvent::Incoming { peer } => format!("incoming call from {}", peer),
        CallEvent::Negotiating { peer } => format!("negotiating with {}", peer),
        CallEvent::Connected { peer } => format!("connected to {}", peer),
        CallEvent::RemoteStream { peer, stream_id } => {
            format!("remote stream {} from {}", stream_id, peer)
        }
        CallEvent::Ended { peer, reason } => {
            let why = match reason {
                EndReason::LocalHangup => "hung up",
                EndReason::TransportFailed => "transport failed",
                EndReason::NegotiationTimeout => "negotiation timed out",
                EndReason::Superseded => "replaced by a newer call",
            };
            format!("call with {} ended: {}", peer, why)
        }
    }
}

async fn start_peer(
    id: ParticipantId,
    channel: Arc<dyn SignalingChannel>,
    transports: Arc<dyn TransportFactory>,
) -> Result<(NegotiatorHandle, mpsc::UnboundedReceiver<CallEvent>)> {
    let (negotiator, events) =
        SessionNegotiator::new(id, channel, transports, NegotiatorConfig::default());
    Ok((spawn_negotiator(negotiator).await?, events))
}

fn drain(label: &str, events: &mut mpsc::UnboundedReceiver<CallEvent>) {
    while let Ok(event) = events.try_recv() {
        println!("[{}] {}", label, describe(&event));
    }
}

fn enabled_effects(video: &LocalVideo) -> String {
    let names: Vec<_> = video.effects().enabled.enabled().map(|e| e.name()).collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// Two negotiators in one process, wired through an in-memory channel and
/// loopback transports. The callee accepts automatically and the caller
/// sends test-pattern video through the configured effects.
pub async fn demo_call(store: ConfigStore) -> Result<()> {
    let channel = MemorySignalingChannel::new();
    let caller_id = ParticipantId::generate();
    let callee_id = ParticipantId::generate();
    println!("caller {} -> callee {}", caller_id, callee_id);

    let caller_transports = Arc::new(DummyTransportFactory::new());
    let (caller, mut caller_events) = start_peer(
        caller_id,
        Arc::new(channel.clone()),
        caller_transports.clone(),
    )
    .await?;
    let (callee, mut callee_events) = start_peer(
        callee_id.clone(),
        Arc::new(channel),
        Arc::new(DummyTransportFactory::new()),
    )
    .await?;

    let video = LocalVideo::start(
        store,
        caller.video_sink(),
        TestPattern::new(DEFAULT_WIDTH, DEFAULT_HEIGHT, DEFAULT_FPS),
    )
    .await?;
    println!("effects: {}", enabled_effects(&video));
    caller.start_call(callee_id).await?;

    timeout(DEMO_TIMEOUT, async {
        loop {
            match callee_events.recv().await {
                Some(event @ CallEvent::Incoming { .. }) => {
                    println!("[callee] {}", describe(&event));
                    callee.accept().await?;
                    break;
                }
                Some(event) => println!("[callee] {}", describe(&event)),
                None => bail!("callee stopped"),
            }
        }
        caller.wait_for_state(SessionState::Connected).await?;
        callee.wait_for_state(SessionState::Connected).await?;
        Ok::<(), anyhow::Error>(())
    })
    .await
    .context("demo call did not connect in time")??;

    drain("caller", &mut caller_events);
    drain("callee", &mut callee_events);

    let transport = caller_transports
        .latest()
        .context("caller has no transport")?;
    timeout(DEMO_TIMEOUT, async {
        while transport.frame_timestamps().len() < DEMO_FRAMES {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("no video reached the transport")?;
    println!(
        "[caller] sent {} video frames",
        transport.frame_timestamps().len()
    );
    video.stop().await;

    caller.hang_up().await?;
    caller.wait_for_state(SessionState::Closed).await?;
    drain("caller", &mut caller_events);

    caller.shutdown().await;
    callee.shutdown().await;
    println!("demo call finished");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Call(ParticipantId),
    Accept,
    HangUp,
    Quit,
    Help,
}

fn parse_input(line: &str) -> Result<Option<Input>> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let input = match word.to_ascii_lowercase().as_str() {
        "call" => match words.next() {
            Some(peer) => Input::Call(ParticipantId::from(peer)),
            None => bail!("usage: call <peer-id>"),
        },
        "accept" | "a" => Input::Accept,
        "hangup" | "hang-up" | "h" => Input::HangUp,
        "quit" | "exit" | "q" => Input::Quit,
        "help" | "?" => Input::Help,
        other => bail!("unknown command: {}", other),
    };
    Ok(Some(input))
}

const HELP: &str = "commands: call <peer-id> | accept | hangup | quit";

#[cfg(feature = "webrtc")]
fn transports() -> Result<Arc<dyn TransportFactory>> {
    Ok(Arc::new(callfx_session::WebRtcTransportFactory::new()?))
}

#[cfg(not(feature = "webrtc"))]
fn transports() -> Result<Arc<dyn TransportFactory>> {
    tracing::info!("built without webrtc, using loopback transports");
    Ok(Arc::new(DummyTransportFactory::new()))
}

/// Each call set up from here runs with the config as it is on disk now.
async fn reload_effects(video: &LocalVideo) {
    match video.reload().await {
        Ok(_) => println!("effects: {}", enabled_effects(video)),
        Err(e) => warn!("keeping previous effects config: {:#}", e),
    }
}

/// Interactive call session over a relay. Reads commands from stdin.
pub async fn relay_call(
    store: ConfigStore,
    relay: &str,
    id: Option<String>,
    peer: Option<String>,
) -> Result<()> {
    let local_id = id
        .map(ParticipantId::from)
        .unwrap_or_else(ParticipantId::generate);
    let channel = RelaySignalingChannel::connect(relay)
        .await
        .with_context(|| format!("connecting to relay {}", relay))?;
    let (handle, mut events) = start_peer(local_id.clone(), Arc::new(channel), transports()?).await?;

    let video = LocalVideo::start(
        store,
        handle.video_sink(),
        TestPattern::new(DEFAULT_WIDTH, DEFAULT_HEIGHT, DEFAULT_FPS),
    )
    .await?;

    println!("your id: {}", local_id);
    println!("{}", HELP);
    if let Some(peer) = peer {
        println!("effects: {}", enabled_effects(&video));
        handle.start_call(peer).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", describe(&event)),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Ok(Some(Input::Call(peer))) => {
                        reload_effects(&video).await;
                        handle.start_call(peer).await?
                    }
                    Ok(Some(Input::Accept)) => {
                        reload_effects(&video).await;
                        handle.accept().await?
                    }
                    Ok(Some(Input::HangUp)) => handle.hang_up().await?,
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(Input::Help)) => println!("{}", HELP),
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    video.stop().await;
    handle.shutdown().await;
    Ok(())
}
