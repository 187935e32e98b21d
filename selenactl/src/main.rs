use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = selenactl::Cli::parse();
    if let Err(err) = selenactl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
