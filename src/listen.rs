//! Direct connections from test drivers.
//!
//! Besides the connection to the registry, the controller accepts connections on its own
//! endpoint. Each of them gets the `ProcessController` as bootstrap capability.

use std::{net::SocketAddr, pin::pin};

use async_net::{TcpListener, TcpStream};
use async_stream::try_stream;
use capnp::private::capability::ClientHook;
use futures::{
    task::{LocalSpawn, LocalSpawnExt},
    AsyncReadExt, Stream, StreamExt,
};
use tracing::{debug, info, warn};

use crate::rpc::run_server_connection;

/// Yields the connections accepted by `listener`.
pub fn listen(
    listener: TcpListener,
) -> impl Stream<Item = Result<(TcpStream, SocketAddr), Box<dyn std::error::Error>>> {
    try_stream! {
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            yield (stream, peer);
        }
    }
}

/// Serves `bootstrap` on every connection accepted by `listener`.
///
/// Connections are run on `spawner`. Returns on the first accept failure.
pub async fn serve<S: LocalSpawn>(
    listener: TcpListener,
    bootstrap: Box<dyn ClientHook>,
    spawner: &S,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("accepting test drivers on {}", listener.local_addr()?);

    let mut conn_stream = pin!(listen(listener));
    while let Some(conn) = conn_stream.next().await {
        let (stream, peer) = conn?;
        debug!("test driver connected from {peer}");
        let (input, output) = stream.split();
        let hook = bootstrap.add_ref();
        if let Err(err) = spawner.spawn_local(async move {
            run_server_connection(input, output, hook).await;
            debug!("test driver {peer} disconnected");
        }) {
            warn!("couldn't serve test driver {peer}: {err}");
        }
    }

    Ok(())
}
