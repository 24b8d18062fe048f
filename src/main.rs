// src/main.rs
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sidechain_node::run().await
}
