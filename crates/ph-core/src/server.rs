use anyhow::Result;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub async fn serve(addr: SocketAddr, router: Router) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, router).await
}

/// Serves on an already bound listener until Ctrl-C.
pub async fn serve_listener(listener: TcpListener, router: Router) -> Result<()> {
    serve_until(listener, router, shutdown_signal()).await
}

/// Serves until `shutdown` resolves, then drains in-flight requests. Tests
/// bind `127.0.0.1:0`, read the port back and stop the server through a
/// channel.
pub async fn serve_until<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    tracing::info!(%addr, "server stopped");
    Ok(())
}

pub async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown requested");
    }
}
