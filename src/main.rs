use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = dialtone::cli::parse_args();
    dialtone::boot::init_logger(&settings);
    log::info!(
        "{} {} starting: {settings:?}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    dialtone::boot::start(settings).await
}
