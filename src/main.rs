#[tokio::main]
async fn main() {
    if let Err(err) = ai_engine::run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
