use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> postgate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = postgate::Config::from_env()?;
    postgate::server::run(config).await
}
