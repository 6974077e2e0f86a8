//! Starter client executable.
//!
//! Plays a short session of the dojo starter game against an in-process World: creates the game
//! if needed, spawns the player, then plays the requested moves, showing the optimistic state
//! as it is predicted and confirmed.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use starter_sync::provider::local::LocalLedger;
use starter_sync::provider::Account;
use starter_sync::selectors::{self, LobbyStatus};
use starter_sync::types::schema::ParsedEntity;
use starter_sync::types::{EntityId, EntityRecord};
use starter_sync::Client;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod args;

use args::StarterArgs;

pub(crate) const LOG_TARGET: &str = "starter_client";

#[tokio::main]
async fn main() -> Result<()> {
    let args = StarterArgs::parse().with_config_file()?;

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder().with_env_filter(filter_layer).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set the global tracing subscriber")?;

    starter_sync::counters::describe_counters();

    let ledger = Arc::new(LocalLedger::new());
    if let Some(path) = &args.seed {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading seed file {}", path.display()))?;
        let entities: Vec<ParsedEntity> = serde_json::from_str(&content)?;
        for entity in entities {
            ledger.set_entity(EntityRecord::try_from(entity)?);
        }
    }

    let client = Client::new(ledger.clone(), ledger.clone(), args.sync.clone());
    let timeout = client.options().watchdog_timeout();
    let player = args.player;
    let game_id = client.options().game_id;

    let _changes = client.store().subscribe_to_changes(|change| {
        debug!(target: LOG_TARGET, entities = change.entities.len(), "Store changed.");
    });

    client.entities(&client.player_filter(player)).await?;
    client.entities(&client.game_filter()).await?;

    let (player_feed, player_service) =
        client.on_entity_updated(client.player_filter(player)).await?;
    let (game_feed, game_service) = client.on_entity_updated(client.game_filter()).await?;
    let player_service = tokio::spawn(player_service);
    let game_service = tokio::spawn(game_service);

    let mut stale = client.watchdog();
    tokio::spawn(async move {
        while let Some(report) = stale.next().await {
            warn!(target: LOG_TARGET, %report, "Unconfirmed action.");
        }
    });

    let calls = client.system_calls(Account::new(player));

    if selectors::lobby_status(client.store(), game_id) == LobbyStatus::NoGame {
        let dispatched = calls.init_game(args.max_players).await?;
        client.dispatcher().wait_resolved(dispatched.action, timeout).await?;
    }
    info!(target: LOG_TARGET, status = ?selectors::lobby_status(client.store(), game_id), "Lobby.");

    let dispatched = calls.spawn().await?;
    info!(
        target: LOG_TARGET,
        moves = ?selectors::player_moves(client.store(), player).map(|m| m.remaining),
        "Spawned."
    );
    let state = client.dispatcher().wait_resolved(dispatched.action, timeout).await?;
    info!(target: LOG_TARGET, action = %dispatched.action, %state, "Spawn resolved.");

    for direction in &args.moves {
        match calls.move_player(*direction).await {
            Ok(dispatched) => {
                info!(
                    target: LOG_TARGET,
                    %direction,
                    position = ?selectors::player_position(client.store(), player).map(|p| p.vec),
                    "Moved."
                );
                let state = client.dispatcher().wait_resolved(dispatched.action, timeout).await?;
                debug!(target: LOG_TARGET, action = %dispatched.action, %state, "Move resolved.");
            }
            Err(error) => warn!(target: LOG_TARGET, %direction, %error, "Move failed."),
        }
    }

    client.dispatcher().clear_resolved();

    let moves = selectors::player_moves(client.store(), player);
    let position = selectors::player_position(client.store(), player);
    info!(
        target: LOG_TARGET,
        remaining = ?moves.as_ref().map(|m| m.remaining),
        position = ?position.as_ref().map(|p| p.vec),
        can_move = selectors::can_move(client.store(), player),
        "Session over."
    );

    if args.json {
        let record = client
            .store()
            .get(&EntityId::from_keys(&[player]))
            .context("Player entity is unknown")?;
        println!("{}", serde_json::to_string_pretty(&ParsedEntity::from(&record))?);
    }

    player_feed.close();
    game_feed.close();
    player_service.await??;
    game_service.await??;

    Ok(())
}
