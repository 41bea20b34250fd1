use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::TcpListener;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use socket2::{Domain, Protocol, Socket, Type};

/// Cooperative stop request, polled once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        StopToken::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// raise the token on SIGINT, SIGQUIT and SIGTERM
    pub fn register_signals(&self) -> io::Result<()> {
        for signal in [SIGINT, SIGQUIT, SIGTERM].iter() {
            let _ = signal_hook::flag::register(*signal, Arc::clone(&self.0))?;
        }

        Ok(())
    }
}

/// Non-blocking client listener with address reuse and no Nagle delay on accepted sockets.
pub fn create_listening_socket(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(TcpListener::from_std(socket.into()))
}
