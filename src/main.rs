#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use pinch_relay::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log_level.as_level())?;

    if config.locked_mode() {
        log::info!("locked mode: only approved keys may connect");
    }

    pinch_relay::startup(config).await
}
