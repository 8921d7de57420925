use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mesa::{Client, Delivery, Message, MessageKind, Server};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

struct TestServer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    messages: Receiver<Message>,
}

impl TestServer {
    /// Runs a server on its own thread, forwarding every polled message to
    /// the test body.
    fn spawn(port: u16, configure: impl FnOnce(&mut Server) + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let (tx, messages) = mpsc::channel();

        let handle = thread::spawn(move || {
            let mut server = Server::new();
            configure(&mut server);
            server.start(port).expect("server bind");
            while !stop_flag.load(Ordering::SeqCst) {
                for message in server.poll() {
                    let _ = tx.send(message);
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = server.stop();
        });

        Self {
            stop,
            handle,
            messages,
        }
    }

    fn expect_message(&self, kind: MessageKind) -> Message {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.messages.recv_timeout(remaining) {
                Ok(message) if message.kind == kind => return message,
                Ok(_) => continue,
                Err(_) => panic!("timed out waiting for {:?}", kind),
            }
        }
    }

    fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().expect("server thread");
    }
}

fn poll_until(client: &mut Client, mut pred: impl FnMut(&Message) -> bool) -> Message {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        for message in client.poll() {
            if pred(&message) {
                return message;
            }
        }
        assert!(Instant::now() < deadline, "timed out polling for message");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn connect_and_disconnect_lifecycle() {
    let port = next_port();
    let server = TestServer::spawn(port, |_| {});

    let mut client = Client::new().unwrap();
    client.connect("127.0.0.1", port).unwrap();
    assert!(client.is_connected());
    // connecting again is a no-op
    client.connect("127.0.0.1", port).unwrap();

    let connect = server.expect_message(MessageKind::Connect);
    assert_ne!(connect.peer_id, 0);

    client.disconnect().unwrap();
    assert!(!client.is_connected());
    let disconnect = server.expect_message(MessageKind::Disconnect);
    assert_eq!(disconnect.peer_id, connect.peer_id);

    // disconnecting again is a no-op
    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn request_gets_matching_response() {
    let port = next_port();
    let server = TestServer::spawn(port, |server| {
        server.on(
            7,
            Box::new(|sender, payload| {
                let mut out = sender.to_be_bytes().to_vec();
                out.extend_from_slice(payload);
                out
            }),
        );
    });

    let mut client = Client::new().unwrap();
    client.connect("127.0.0.1", port).unwrap();

    let response = client.request(7, b"ping").unwrap();
    assert_eq!(response.kind, MessageKind::DataResponse);
    assert_eq!(&response.payload[4..], b"ping");

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn connect_resolves_hostnames() {
    let port = next_port();
    let server = TestServer::spawn(port, |_| {});

    let mut client = Client::new().unwrap();
    client.connect("localhost", port).unwrap();
    assert!(client.is_connected());
    server.expect_message(MessageKind::Connect);

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn unresolvable_hostname_is_a_transport_error() {
    let mut client = Client::new().unwrap();
    let result = client.connect("host.invalid", 1);
    assert!(matches!(result, Err(mesa::NetError::Transport(_))));
    assert!(!client.is_connected());
}

#[test]
fn late_response_surfaces_in_the_next_poll() {
    let port = next_port();
    // the handler stalls the server's poll loop long enough that its
    // response cannot beat the client's deadline
    let server = TestServer::spawn(port, |server| {
        server.on(
            5,
            Box::new(|_, _| {
                thread::sleep(Duration::from_millis(400));
                b"late".to_vec()
            }),
        );
    });

    let mut client = Client::new().unwrap();
    client.connect("127.0.0.1", port).unwrap();
    client.set_request_timeout(Duration::from_millis(150));

    let result = client.request(5, &[]);
    assert!(matches!(result, Err(mesa::NetError::RequestTimeout(_))));

    // the response still arrives and is visible as an unmatched message
    let late = poll_until(&mut client, |m| m.kind == MessageKind::DataResponse);
    assert_eq!(late.payload, b"late");
    assert_ne!(late.request_id, 0);

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn request_times_out_without_a_handler() {
    let port = next_port();
    let server = TestServer::spawn(port, |_| {});

    let mut client = Client::new().unwrap();
    client.connect("127.0.0.1", port).unwrap();
    client.set_request_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let result = client.request(9, &[]);
    assert!(matches!(result, Err(mesa::NetError::RequestTimeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(200));

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn request_is_also_surfaced_to_the_server_poll() {
    let port = next_port();
    let server = TestServer::spawn(port, |server| {
        server.on(1, Box::new(|_, _| b"response".to_vec()));
    });

    let mut client = Client::new().unwrap();
    client.connect("127.0.0.1", port).unwrap();
    let connect = server.expect_message(MessageKind::Connect);

    let response = client.request(1, b"a").unwrap();
    assert_eq!(response.payload, b"response");

    // answering a request inline does not swallow it from the poll stream
    let request = server.expect_message(MessageKind::DataRequest);
    assert_eq!(request.peer_id, connect.peer_id);

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn broadcast_reaches_every_client() {
    let port = next_port();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let handle = thread::spawn(move || {
        let mut server = Server::new();
        server.start(port).expect("server bind");
        let mut sent = false;
        while !stop_flag.load(Ordering::SeqCst) {
            server.poll();
            if !sent && server.num_clients() == 2 {
                server
                    .broadcast(Delivery::Reliable, b"hello".to_vec())
                    .unwrap();
                sent = true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = server.stop();
    });

    let mut a = Client::new().unwrap();
    let mut b = Client::new().unwrap();
    a.connect("127.0.0.1", port).unwrap();
    b.connect("127.0.0.1", port).unwrap();

    for client in [&mut a, &mut b] {
        let message = poll_until(client, |m| m.kind == MessageKind::Data);
        assert_eq!(message.payload, b"hello");
    }

    a.disconnect().unwrap();
    b.disconnect().unwrap();
    stop.store(true, Ordering::SeqCst);
    handle.join().expect("server thread");
}

#[test]
fn broadcast_with_no_clients_is_a_noop() {
    let port = next_port();
    let mut server = Server::new();
    server.start(port).unwrap();
    assert!(server.broadcast(Delivery::Unreliable, vec![1, 2, 3]).is_ok());
    server.stop().unwrap();
}

#[test]
fn send_to_unknown_id_is_reported() {
    let port = next_port();
    let mut server = Server::new();
    server.start(port).unwrap();
    assert!(matches!(
        server.send(999, Delivery::Reliable, vec![]),
        Err(mesa::NetError::UnknownPeer(999))
    ));
    server.stop().unwrap();
}

#[test]
fn ids_stay_unique_across_connection_churn() {
    let port = next_port();
    let server = TestServer::spawn(port, |_| {});

    let mut first = Client::new().unwrap();
    first.connect("127.0.0.1", port).unwrap();
    let id1 = server.expect_message(MessageKind::Connect).peer_id;
    first.disconnect().unwrap();
    server.expect_message(MessageKind::Disconnect);

    let mut second = Client::new().unwrap();
    second.connect("127.0.0.1", port).unwrap();
    let id2 = server.expect_message(MessageKind::Connect).peer_id;

    assert_ne!(id1, id2);

    second.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn client_reconnects_after_server_restart() {
    let port = next_port();
    let server = TestServer::spawn(port, |_| {});

    let mut client = Client::new().unwrap();
    client.connect("127.0.0.1", port).unwrap();
    server.expect_message(MessageKind::Connect);
    client.disconnect().unwrap();
    server.shutdown();

    let server = TestServer::spawn(port, |_| {});
    client.connect("127.0.0.1", port).unwrap();
    assert!(client.is_connected());
    server.expect_message(MessageKind::Connect);

    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn data_sent_before_a_request_is_queued_behind_it() {
    let port = next_port();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    // server pushes a data message at connect time and answers requests
    let handle = thread::spawn(move || {
        let mut server = Server::new();
        server.on(2, Box::new(|_, _| b"answer".to_vec()));
        server.start(port).expect("server bind");
        while !stop_flag.load(Ordering::SeqCst) {
            for message in server.poll() {
                if message.kind == MessageKind::Connect {
                    server
                        .send(message.peer_id, Delivery::Reliable, b"greeting".to_vec())
                        .unwrap();
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = server.stop();
    });

    let mut client = Client::new().unwrap();
    client.connect("127.0.0.1", port).unwrap();

    // give the greeting time to land so the request wait has to queue it
    thread::sleep(Duration::from_millis(50));

    let response = client.request(2, &[]).unwrap();
    assert_eq!(response.payload, b"answer");

    // the greeting was not lost; it comes out of the next poll
    let greeting = poll_until(&mut client, |m| m.kind == MessageKind::Data);
    assert_eq!(greeting.payload, b"greeting");

    client.disconnect().unwrap();
    stop.store(true, Ordering::SeqCst);
    handle.join().expect("server thread");
}
