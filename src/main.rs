#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::Path;

use turn_server::{accounts, config::Config, server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log_level.as_level())?;

    let accounts = accounts::load(Path::new(&config.account_file))?;
    log::info!("loaded {} account(s) from {}", accounts.len(), config.account_file);

    server::run(config, accounts).await
}
