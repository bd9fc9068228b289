use console::style;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tether_config::TetherConfig;
use tether_core::{Result, SdpType, TetherError};
use tether_mesh::{GlareResolver, LocalPeer, LoopbackNetwork, SyntheticMediaSource};

use super::describe_event;

pub(super) async fn cmd_demo(
    config: TetherConfig,
    peers: usize,
    media: bool,
    json: bool,
    timeout_secs: u64,
) -> Result<()> {
    if peers < 2 {
        return Err(TetherError::Config("a mesh needs at least 2 peers".into()));
    }

    let network = LoopbackNetwork::new();
    let glare: Arc<dyn GlareResolver> = Arc::new(config.peer.glare_rule);
    let mesh: Vec<LocalPeer> = (1..=peers)
        .map(|i| {
            LocalPeer::builder(Arc::new(network.clone()), glare.clone())
                .id(format!("peer-{i}"))
                .config(config.clone())
                .media_source(Arc::new(SyntheticMediaSource::new()))
                .build()
        })
        .collect();

    if !json {
        for peer in &mesh {
            follow(peer);
        }
    }

    if media {
        for peer in &mesh {
            peer.add_user_stream().await?;
        }
    }

    // Each newcomer only ever hears of its predecessor; discovery has to
    // introduce it to everyone else.
    let deadline = Duration::from_secs(timeout_secs);
    for joined in 2..=mesh.len() {
        let newcomer = &mesh[joined - 1];
        let existing = &mesh[joined - 2];
        info!(newcomer = %newcomer.id(), existing = %existing.id(), "bootstrapping");
        bootstrap(newcomer, existing).await?;

        let group = &mesh[..joined];
        let converge = wait_for_mesh(group, config.peer.announce_peers, media);
        if tokio::time::timeout(deadline, converge).await.is_err() {
            print_table(&mesh, json)?;
            return Err(TetherError::Transport(format!(
                "mesh of {joined} peers did not converge within {timeout_secs}s"
            )));
        }
    }

    print_table(&mesh, json)?;
    for peer in &mesh {
        peer.shutdown().await;
    }
    Ok(())
}

/// Carry `newcomer`'s first offer to `existing` and the answer back.
async fn bootstrap(newcomer: &LocalPeer, existing: &LocalPeer) -> Result<()> {
    let offer = newcomer.get_first_offer().await?;
    let answer = existing
        .set_first_offer_or_answer(offer)
        .await?
        .ok_or_else(|| TetherError::Transport("offer was not answered".into()))?;
    answer.description.expect_type(SdpType::Answer)?;
    newcomer.set_first_offer_or_answer(answer).await?;
    Ok(())
}

fn expected_links(index: usize, len: usize, announce: bool) -> usize {
    if announce {
        len - 1
    } else {
        usize::from(index > 0) + usize::from(index + 1 < len)
    }
}

async fn wait_for_mesh(group: &[LocalPeer], announce: bool, media: bool) {
    loop {
        let done = group.iter().enumerate().all(|(i, peer)| {
            let connections = peer.connections();
            connections.len() == expected_links(i, group.len(), announce)
                && connections.iter().all(|c| {
                    c.is_connected() && (!media || !c.inbound_streams().is_empty())
                })
        });
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn follow(peer: &LocalPeer) {
    let mut events = peer.events().subscribe();
    let id = peer.id().clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            eprintln!("{} {}", style(format!("[{id}]")).dim(), describe_event(&event));
        }
    });
}

fn print_table(mesh: &[LocalPeer], json: bool) -> Result<()> {
    if json {
        let table: serde_json::Map<String, serde_json::Value> = mesh
            .iter()
            .map(|peer| -> Result<(String, serde_json::Value)> {
                Ok((
                    peer.id().to_string(),
                    serde_json::to_value(peer.connection_infos())?,
                ))
            })
            .collect::<Result<_>>()?;
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    println!();
    println!("{}", style(format!("Mesh of {} peers", mesh.len())).bold());
    println!(
        "   {:<10} {:<12} {:<12} {:<10} {:>4} {:>4}  {}",
        "local", "remote", "state", "signaling", "out", "in", "channels"
    );
    for peer in mesh {
        for info in peer.connection_infos() {
            let state = info.states.connection.to_string();
            let state = if info.states.connection.is_terminal() {
                style(state).red()
            } else {
                style(state).green()
            };
            println!(
                "   {:<10} {:<12} {:<12} {:<10} {:>4} {:>4}  {}",
                peer.id().as_str(),
                info.peer_id.short(),
                state,
                info.states.signaling.as_str(),
                info.outbound_streams,
                info.inbound_streams,
                info.open_channels.join(",")
            );
        }
    }
    Ok(())
}
