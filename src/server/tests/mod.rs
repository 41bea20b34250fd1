
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::WorkerConfig;
use crate::protocol::RequesterId;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// a connected pair: the client end and the server end as a non-blocking mio stream
pub fn socket_pair() -> (TcpStream, mio::net::TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    (client, mio::net::TcpStream::from_std(server))
}

/// three peers, the local one (id 1) listening on an ephemeral port
pub fn local_config() -> WorkerConfig {
    WorkerConfig::from_peer_string(1, "0:127.0.0.1:7000,1:127.0.0.1:0,2:127.0.0.1:7002").unwrap()
}

pub fn payload(requester: RequesterId, data: &[u8]) -> Vec<u8> {
    let mut payload = requester.to_ne_bytes().to_vec();
    payload.extend_from_slice(data);
    payload
}

/// retry `cond` until it holds, panicking after a few seconds
pub fn eventually<F: FnMut() -> bool>(mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition never held");
        thread::sleep(Duration::from_millis(2));
    }
}
