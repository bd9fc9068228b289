//! Manual pairing of two processes over WebRTC.
//!
//! One side runs `tether offer`, pastes the printed line into `tether answer`
//! on the other side, and pastes the answer back. Further peers can join
//! either process the same way and discovery meshes them.

use console::style;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use tether_config::{ConfigLoader, ConfigWatcher};
use tether_core::{Event, PeerId, Result, SdpType, TetherError};
use tether_mesh::{FirstDescription, GlareResolver, LocalPeer, SyntheticMediaSource, WebRtcProvider};

use super::describe_event;

/// The peer reads the loader's shared config, so edits picked up by the
/// watcher apply to connections opened afterwards.
fn build_peer(loader: &ConfigLoader, id: Option<String>) -> LocalPeer {
    let glare: Arc<dyn GlareResolver> = Arc::new(loader.get().peer.glare_rule);
    LocalPeer::builder(Arc::new(WebRtcProvider), glare)
        .id(id.map(PeerId::from).unwrap_or_else(PeerId::generate))
        .shared_config(loader.shared())
        .media_source(Arc::new(SyntheticMediaSource::new()))
        .build()
}

/// Hot-reload the config file for as long as the returned watcher lives.
fn watch_config(loader: &ConfigLoader) -> Option<ConfigWatcher> {
    if !loader.path().exists() {
        debug!(path = %loader.path().display(), "no config file, hot-reload disabled");
        return None;
    }
    match loader.watch() {
        Ok(watcher) => {
            eprintln!("{}", style("Config hot-reload: enabled").dim());
            Some(watcher)
        }
        Err(e) => {
            warn!(error = %e, "config hot-reload disabled");
            None
        }
    }
}

pub(super) async fn cmd_offer(loader: &ConfigLoader, id: Option<String>, media: bool) -> Result<()> {
    let _watcher = watch_config(loader);
    let peer = build_peer(loader, id);
    if media {
        peer.add_user_stream().await?;
    }

    let offer = peer.get_first_offer().await?;
    eprintln!("{}", style(format!("Local peer {}. Send this offer:", peer.id())).bold());
    println!("{}", serde_json::to_string(&offer)?);

    eprintln!("{}", style("Paste the answer and press enter:").bold());
    let answer: FirstDescription = read_line().await?;
    answer.description.expect_type(SdpType::Answer)?;
    peer.set_first_offer_or_answer(answer).await?;

    follow(peer).await
}

pub(super) async fn cmd_answer(loader: &ConfigLoader, id: Option<String>, media: bool) -> Result<()> {
    let _watcher = watch_config(loader);
    let peer = build_peer(loader, id);
    if media {
        peer.add_user_stream().await?;
    }

    eprintln!("{}", style(format!("Local peer {}. Paste the offer:", peer.id())).bold());
    let offer: FirstDescription = read_line().await?;
    let answer = peer
        .set_first_offer_or_answer(offer)
        .await?
        .ok_or_else(|| TetherError::InvalidDescriptionType {
            expected: "offer".into(),
            actual: "answer".into(),
        })?;
    eprintln!("{}", style("Send this answer back:").bold());
    println!("{}", serde_json::to_string(&answer)?);

    follow(peer).await
}

async fn read_line<T: DeserializeOwned>() -> Result<T> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(serde_json::from_str(line.trim())?)
}

/// Print mesh events until Ctrl-C, then shut the peer down.
async fn follow(peer: LocalPeer) -> Result<()> {
    let mut events = peer.events().subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(Event::Shutdown) | Err(RecvError::Closed) => break,
                Ok(event) => println!("{}", describe_event(&event)),
                Err(RecvError::Lagged(n)) => {
                    eprintln!("{}", style(format!("({n} events skipped)")).dim());
                }
            },
        }
    }
    peer.shutdown().await;
    Ok(())
}
