//! Listener plumbing shared by the tunnel and notify servers.

use std::net::TcpListener;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use dataminer_core::defaults::SHUTDOWN_GRACE_SECS;
use dataminer_core::{Error, Result, TlsConfig};
use tracing::info;

/// Load PEM certificate and key once; the result is cheap to clone.
pub async fn load_tls(config: &TlsConfig) -> Result<RustlsConfig> {
    RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| {
            Error::Config(format!(
                "failed to load TLS material from {} / {}: {}",
                config.cert_path.display(),
                config.key_path.display(),
                e
            ))
        })
}

/// Serve `app` on an already bound listener until `handle` shuts it down.
pub async fn serve_listener(
    listener: TcpListener,
    app: Router,
    tls: Option<RustlsConfig>,
    handle: Handle,
) -> Result<()> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    info!(%addr, tls = tls.is_some(), "Listener serving");
    match tls {
        Some(config) => {
            axum_server::tls_rustls::from_tcp_rustls(listener, config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?
        }
        None => {
            axum_server::from_tcp(listener)
                .handle(handle)
                .serve(app.into_make_service())
                .await?
        }
    }
    Ok(())
}

/// Ask a server to stop, giving open connections a short grace period.
pub fn shutdown(handle: &Handle) {
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
