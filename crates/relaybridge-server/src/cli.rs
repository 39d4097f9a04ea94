use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "relaybridge-server", about = "Relay bridge state engine")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/relaybridge.toml")]
    pub config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}
