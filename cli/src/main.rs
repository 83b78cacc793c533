use clap::Parser;
use procpipe_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    procpipe_cli::init_tracing();
    let cli = Cli::parse();
    let code = procpipe_cli::run(cli).await?;
    // Exit here so a stdin read still parked on the blocking pool cannot
    // hold up runtime shutdown.
    std::process::exit(code);
}
