use std::{net::SocketAddr, num::NonZeroUsize, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{DuplicateIdentity, HubConfig, SessionConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the presence hub, accepting WebSocket sessions at /ws.
    Serve(ServeArgs),
    /// Send one location update to a running hub and print its first reply.
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Frames buffered per session before it is dropped as a slow consumer.
    #[arg(long, default_value = "256")]
    pub queue_capacity: NonZeroUsize,

    /// Commands buffered by the hub task.
    #[arg(long, default_value = "1024")]
    pub inbox_capacity: NonZeroUsize,

    /// Disconnect sessions that send nothing for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Give up on a peer whose socket accepts nothing for this many seconds.
    #[arg(long, default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// What to do when a username that is already connected joins again.
    #[arg(long, value_enum, default_value_t = DuplicateIdentity::EvictPrevious)]
    pub duplicate_identity: DuplicateIdentity,
}

impl ServeArgs {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            inbox_capacity: self.inbox_capacity,
            duplicate_identity: self.duplicate_identity,
            session: SessionConfig {
                queue_capacity: self.queue_capacity,
                idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
                write_timeout: Duration::from_secs(self.write_timeout_secs),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// WebSocket endpoint of the hub.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    pub server: String,

    /// Username to connect as.
    #[arg(long, default_value = "testuser")]
    pub username: String,

    /// Latitude to report.
    #[arg(long, default_value_t = 35.0, allow_negative_numbers = true)]
    pub lat: f64,

    /// Longitude to report.
    #[arg(long, default_value_t = 135.0, allow_negative_numbers = true)]
    pub lon: f64,

    /// Seconds to wait for the hub's reply.
    #[arg(long, default_value_t = 3)]
    pub reply_timeout_secs: u64,
}

impl ProbeArgs {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_hub_defaults() {
        let cli = Cli::parse_from(["presence_hub", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.listen, "0.0.0.0:8080".parse::<SocketAddr>().expect("valid addr"));
        assert_eq!(args.hub_config(), HubConfig::default());
    }

    #[test]
    fn serve_flags_build_hub_config() {
        let cli = Cli::parse_from([
            "presence_hub",
            "serve",
            "--queue-capacity",
            "8",
            "--idle-timeout-secs",
            "30",
            "--write-timeout-secs",
            "2",
            "--duplicate-identity",
            "reject",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        let config = args.hub_config();
        assert_eq!(config.session.queue_capacity.get(), 8);
        assert_eq!(config.session.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.session.write_timeout, Duration::from_secs(2));
        assert_eq!(config.duplicate_identity, DuplicateIdentity::Reject);
    }

    #[test]
    fn probe_accepts_southern_coordinates() {
        let cli = Cli::parse_from(["presence_hub", "probe", "--lat", "-33.87", "--lon", "151.21"]);
        let Command::Probe(args) = cli.command else {
            panic!("expected probe command");
        };
        assert_eq!(args.lat, -33.87);
        assert_eq!(args.username, "testuser");
        assert_eq!(args.reply_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let result = Cli::try_parse_from(["presence_hub", "serve", "--queue-capacity", "0"]);
        assert!(result.is_err());
    }
}
