use telemetry_agent::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::main().await
}
