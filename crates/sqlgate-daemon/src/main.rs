use anyhow::Result;

use sqlgate_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("sqlgate")?;
    sqlgate_daemon::server::run().await
}
