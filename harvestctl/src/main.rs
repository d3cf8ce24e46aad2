use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = harvestctl::Cli::parse();
    harvestctl::init_tracing(&cli.log_level);
    if let Err(err) = harvestctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
