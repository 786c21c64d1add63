use anyhow::Result;
use skylure::Runner;

#[tokio::main]
async fn main() -> Result<()> {
    Runner::start().await
}
