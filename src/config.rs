use clap::Parser;

/// Peer-to-peer key/value node on a Chord ring.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Port to listen on for peer calls (0 picks an ephemeral port)
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// Address to bind the peer server to
    #[arg(short, long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Successor-list length; each key is held by its owner plus the
    /// owner's next r-1 successors
    #[arg(short, long, default_value = "3")]
    pub replicas: usize,

    /// Milliseconds between stabilization rounds
    #[arg(short, long, default_value = "1000")]
    pub stabilize_ms: u64,

    /// Address of an existing ring member to join at startup
    #[arg(short, long)]
    pub join: Option<String>,
}
