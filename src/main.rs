#[tokio::main]
async fn main() -> anyhow::Result<()> {
    historify_lib::run().await
}
