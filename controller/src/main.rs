mod api;
mod hardware;
mod host;
mod sync;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
