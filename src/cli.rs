// CLI argument parsing
use clap::Parser;

use crate::room::RoomName;

/// Keeps this device's state in sync with other devices over MQTT rooms
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Rooms to join. Defaults to the room saved in settings.
    #[arg(value_name = "ROOM")]
    pub rooms: Vec<RoomName>,

    /// Leave rooms down after a broker drop instead of reconnecting
    #[arg(long, default_value_t = false)]
    pub no_reconnect: bool,
}
