use torii_server::{GatewayServer, config::loader, init_tracing};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(err) = run().await {
        eprintln!("torii: {err}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = loader::load_config(None).map_err(anyhow::Error::msg)?;
    let server = GatewayServer::new(config)?;
    server.run().await
}
