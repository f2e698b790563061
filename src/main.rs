#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use dht_node::config::Config;

fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.max_threads)
        .enable_all()
        .build()?
        .block_on(run(config))
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let node = dht_node::startup(config).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("interrupt received, shutting down");
    node.shutdown().await;

    Ok(())
}
