use anyhow::Result;
use clap::Parser;

use tilescale::serve::{self, ServeArgs};

#[derive(Parser, Debug)]
#[command(name = "tilescale-server", about = "Tiled multi-stage image upscaling server")]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    serve::run(cli.serve)
}
