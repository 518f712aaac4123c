//! Cap'n Proto RPC plumbing.
//!
//! [`controller_capnp`] holds the bindings generated from `schema/controller.capnp`.
//!
//! [`run_server_connection`] wires communication streams with a bootstrap capability and serves
//! it until the connection ends.
//!
//! [`client_connection`] wires communication streams and returns the bootstrap capability of the
//! peer. The local side may expose a bootstrap capability too, which is how the registry calls
//! back into the controller over the connection the controller opened.

use capnp::{
    capability::{Client, FromClientHook},
    private::capability::ClientHook,
};
use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use futures::{
    io::{BufReader, BufWriter},
    AsyncRead, AsyncWrite,
};
use tracing::debug;

pub mod controller;

capnp::generated_code!(pub mod controller_capnp);

/// Runs a new RPC server connection.
///
/// The communication goes through the passed input and output. The served capability is passed
/// as an abstract `capnp` client. Returns when the peer disconnects.
pub async fn run_server_connection<R, W>(input: R, output: W, client: Box<dyn ClientHook>)
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let network = twoparty::VatNetwork::new(
        BufReader::new(input),
        BufWriter::new(output),
        rpc_twoparty_capnp::Side::Server,
        Default::default(),
    );
    let rpc_system = RpcSystem::new(Box::new(network), Some(Client { hook: client }));

    match rpc_system.await {
        Ok(()) => debug!("connection closed"),
        Err(err) => debug!("connection interrupted: {err}"),
    }
}

/// Creates a RPC client connection.
///
/// The communication goes through the passed input and output. `bootstrap` is offered to the
/// peer, if any.
///
/// The returned value is made of a system to be run by the async runtime and the peer bootstrap
/// interface to initiate RPC requests.
pub fn client_connection<T, R, W>(
    input: R,
    output: W,
    bootstrap: Option<Box<dyn ClientHook>>,
) -> (RpcSystem<rpc_twoparty_capnp::Side>, T)
where
    T: FromClientHook,
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let network = twoparty::VatNetwork::new(
        BufReader::new(input),
        BufWriter::new(output),
        rpc_twoparty_capnp::Side::Client,
        Default::default(),
    );
    let mut rpc_system = RpcSystem::new(
        Box::new(network),
        bootstrap.map(|hook| Client { hook }),
    );
    let peer: T = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);
    (rpc_system, peer)
}
