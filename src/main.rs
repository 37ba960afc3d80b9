#[cfg(feature = "server")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chorus::server::run().await
}
