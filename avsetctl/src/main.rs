use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = avsetctl::Cli::parse();
    if let Err(err) = avsetctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
