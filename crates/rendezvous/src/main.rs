use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "rendezvous",
    version,
    about = "rendezvous - reverse-tunnel relay joining servers and clients by uuid"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses RENDEZVOUS_CONFIG; then auto-detects rendezvous.toml > rendezvous.yaml > rendezvous.yml from CWD; then falls back to the OS default path (Linux: /etc/rendezvous/rendezvous.toml; others: user config dir).
    #[arg(long, env = "RENDEZVOUS_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    rendezvous::run(cli.config).await
}
