//! The accept loop.
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{Result, config::Config, net::TlsContext, pool::Pool, session};

/// Bind the listener and serve client sessions until a shutdown signal.
///
/// Each accepted socket becomes an independent session task; the only state
/// they share is the pool worker behind its command channel.
pub async fn run(config: Config) -> Result<()> {
    config.validate()?;
    let config = Arc::new(config);
    let tls = TlsContext::build(&config)?;

    let listener =
        TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
    let pool = Pool::new(Arc::clone(&config), tls.connector.clone());

    info!(
        listen = %format_args!("{}:{}", config.listen_host, config.listen_port),
        server = %format_args!("{}:{}", config.server_host, config.server_port),
        mode = %config.pool_mode,
        max_client_conn = config.max_client_conn,
        pool_size = config.pool_size,
        "pooler listening"
    );

    let mut next_session_id: u64 = 1;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let id = next_session_id;
                        next_session_id += 1;
                        debug!(session = id, %peer, "client connected");
                        tokio::spawn(session::run(
                            id,
                            socket,
                            Arc::clone(&config),
                            tls.acceptor.clone(),
                            pool.clone(),
                        ));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                pool.shutdown();
                break;
            }
        }
    }

    Ok(())
}
