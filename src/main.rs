use clap::Parser;
use ticker_sync::persistence::schema::Settings;
use ticker_sync::{AppError, Cli, SyncConfig, SyncContext, TypedStore};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ticker_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ticker-sync");

    let mut config = SyncConfig::from_env()?;
    if cli.no_reconnect {
        config.room.auto_reconnect = false;
    }
    let context = SyncContext::from_config(&config)?;
    context.persistence.ready().await?;

    // Rooms from the command line, else the one saved in settings
    let mut room_names: Vec<String> = cli.rooms.iter().map(|room| room.to_string()).collect();
    if room_names.is_empty() {
        let settings = TypedStore::new(context.persistence.clone())
            .get_or_default::<Settings>()
            .await?;
        room_names.extend(settings.sync_room);
    }
    if room_names.is_empty() {
        warn!("No rooms to join; pass room names as arguments or set settings.syncRoom");
        return Ok(());
    }

    for name in &room_names {
        if let Err(e) = context.join_room(name).await {
            warn!(room = %name, error = %e, "Skipping room");
        }
    }

    let mut status = context.coordinator.subscribe_status();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                info!(
                    rooms = ?snapshot.rooms,
                    connected = ?snapshot.connected_rooms,
                    in_sync = snapshot.all_rooms_in_sync,
                    participants = snapshot.total_participants,
                    "Coordinator status"
                );
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    context.coordinator.disconnect_all().await;
    Ok(())
}
