//! A minimal TCP relay for a single PostgreSQL backend.
//!
//! Accepts frontend connections, answers their first packet (refusing SSL;
//! this demo speaks plaintext), pairs each startup with a fresh backend
//! connection, and relays both directions until either side hangs up.
//! Cancel requests arriving on new connections are dispatched to the
//! session they name.
//!
//! ```sh
//! cargo run --example simpleproxy -- 127.0.0.1:6432 127.0.0.1:5432
//! psql -h 127.0.0.1 -p 6432 postgres
//! ```

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use pgrelay::protocol::{
    is_cancel_request, is_ssl_request, wire, CancelRequest, MessageStream, Startup,
};
use pgrelay::{Connector, Router, Session, SessionManager, TlsClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let listen = args.next().unwrap_or_else(|| "127.0.0.1:6432".to_string());
    let backend = args.next().unwrap_or_else(|| "127.0.0.1:5432".to_string());

    let manager = Arc::new(SessionManager::new());
    let listener = TcpListener::bind(&listen).await?;
    info!(%listen, %backend, "proxy listening");

    loop {
        let (conn, peer) = listener.accept().await?;
        let manager = manager.clone();
        let backend = backend.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(manager, conn, &backend).await {
                error!(%peer, error = %err, "connection ended");
            }
        });
    }
}

async fn serve(
    manager: Arc<SessionManager>,
    conn: TcpStream,
    backend_addr: &str,
) -> pgrelay::Result<()> {
    let mut frontend = MessageStream::frontend(conn);

    loop {
        let mut first = frontend.next().await?;
        first.force().await?;

        if is_ssl_request(&first) {
            drop(first);
            frontend.send_ssl_reply(wire::REJECT_SSL_REPLY).await?;
            continue;
        }

        if is_cancel_request(&first) {
            let req = CancelRequest::parse(&mut first).await?;
            return manager.cancel(req.backend_pid, req.secret_key).await;
        }

        // A StartupMessage: pair this frontend with a fresh backend
        // connection carrying the client's own options.
        let startup = Startup::parse(&mut first).await?;
        drop(first);

        let connector = Arc::new(Connector::new(
            backend_addr,
            TlsClient::disabled(),
            startup.params,
        ));
        let backend = connector.startup().await?;
        let session = Session::new(Router::new(frontend, backend), connector);
        return manager.run_session(session).await;
    }
}
