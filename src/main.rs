#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = markwise::run().await {
        eprintln!("markwise fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
