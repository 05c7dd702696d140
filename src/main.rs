//! Lobby handoff demo: a host and a guest meet in a room, get ready and hand off to one battle.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lobby_handoff::{
    config::AppConfig,
    dao::{
        battle::{InMemoryBattleMirror, InMemoryBattleService},
        room_store::{InMemoryRoomStore, RoomStore},
    },
    dto::team::{Team, TeamSlot},
    services::{
        room_service::RoomService,
        session::{SessionExit, StartOutcome, spawn_session},
    },
    state::{LobbyContext, RoomView, SharedContext, role::Identity},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let store = open_store().await;
    let ctx = LobbyContext::new(
        store,
        Arc::new(InMemoryBattleService::new()),
        Arc::new(InMemoryBattleMirror::new()),
        config,
    );

    tokio::select! {
        result = run_demo(ctx) => result,
        _ = shutdown_signal() => {
            info!("shutdown requested; leaving before hand-off");
            Ok(())
        }
    }
}

/// Use CouchDB when it is configured, otherwise keep rooms in memory.
async fn open_store() -> Arc<dyn RoomStore> {
    #[cfg(feature = "couch-store")]
    {
        use lobby_handoff::dao::room_store::couchdb::{CouchConfig, CouchRoomStore};

        match CouchConfig::from_env() {
            Ok(config) => match CouchRoomStore::connect(config).await {
                Ok(store) => {
                    info!("using CouchDB room store");
                    return Arc::new(store);
                }
                Err(err) => warn!(error = %err, "CouchDB unavailable; using in-memory rooms"),
            },
            Err(err) => info!(reason = %err, "CouchDB not configured; using in-memory rooms"),
        }
    }
    Arc::new(InMemoryRoomStore::new())
}

async fn run_demo(ctx: SharedContext) -> anyhow::Result<()> {
    let host = Identity::new("ash", "Ash");
    let guest = Identity::new("gary", "Gary");

    let room = RoomService::new(ctx.store())
        .create_room(&host, Some(demo_team("sparks", "Sparks", 25)))
        .await
        .context("creating room")?;
    info!(room_id = %room.room_id, "room open");

    let host_session = spawn_session(ctx.clone(), &room.room_id, host);
    let guest_session = spawn_session(ctx.clone(), &room.room_id, guest);
    host_session.wait_for(RoomView::is_initialized).await?;
    guest_session.wait_for(RoomView::is_initialized).await?;

    guest_session
        .select_team(demo_team("embers", "Embers", 4))
        .await
        .context("guest team selection")?;
    guest_session.set_ready(true).await.context("guest ready")?;
    host_session
        .wait_for(|view| view.room().is_some_and(|room| room.guest_ready))
        .await?;
    host_session.set_ready(true).await.context("host ready")?;
    host_session
        .wait_for(|view| view.room().is_some_and(|room| room.host_ready))
        .await?;

    match host_session.start_battle().await.context("starting battle")? {
        StartOutcome::Started { battle_id } => info!(%battle_id, "battle started"),
        StartOutcome::AlreadyInProgress => info!("battle start already in progress"),
    }

    for (who, exit) in [
        ("host", host_session.wait().await),
        ("guest", guest_session.wait().await),
    ] {
        let params = match exit {
            SessionExit::HandedOff(params) => params,
            other => bail!("{who} session ended without hand-off: {other:?}"),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&params).context("serializing hand-off bundle")?
        );
    }
    Ok(())
}

fn demo_team(id: &str, name: &str, species_id: u32) -> Team {
    Team {
        id: id.into(),
        name: name.into(),
        slots: vec![
            TeamSlot::new(species_id, 50, &["tackle", "growl"]),
            TeamSlot::new(species_id + 1, 50, &["quick attack"]),
        ],
    }
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,lobby_handoff=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
