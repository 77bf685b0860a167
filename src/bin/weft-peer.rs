use weft::peer::detect_local_ip;
use weft::{Config, Peer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::load()?;

    let ip = detect_local_ip(&config.tracker.host, config.tracker.port);
    let peer = Peer::start(config, &ip).await?;

    println!("Peer running on {}", peer.addr());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    Ok(())
}
