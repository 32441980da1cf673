use fileflow_app::setup;
use fileflow_core::Config;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let app = setup::initialize_app(config).await?;

    setup::shutdown::shutdown_signal().await;
    app.shutdown().await;
    fileflow_infra::shutdown_telemetry().await;

    Ok(())
}
