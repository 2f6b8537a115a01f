use carebridge_server::{AppConfig, CarebridgeServer, build_default_host, init_tracing_with_level};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };
    init_tracing_with_level(&config.logging.level);

    let (_dispatcher, pool, host) = match build_default_host(&config) {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("startup error: {err}");
            std::process::exit(1);
        }
    };

    let server = CarebridgeServer::new(config, host, pool);
    if let Err(err) = server.run().await {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
}
