//! Dealer ping-pong over TCP: no drops, no reordering.

use std::time::Duration;

use driveshaft::zmq::{Context, Socket, SocketOption, SocketType};

#[test]
fn dealer_ping_pong_1000_rounds() {
    driveshaft::dev_tracing::init_tracing();

    let port = portpicker::pick_unused_port().expect("free port");
    let endpoint = format!("tcp://127.0.0.1:{port}");

    let ctx = Context::new().unwrap();

    let mut server = Socket::new(&ctx, SocketType::Dealer).unwrap();
    server
        .set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(10))))
        .unwrap();
    server.bind(&endpoint).unwrap();

    let mut client = Socket::new(&ctx, SocketType::Dealer).unwrap();
    client
        .set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(10))))
        .unwrap();
    client.connect(&endpoint).unwrap();

    for round in 0..1000 {
        let request = format!("hello world : {round}");
        client.send(request.as_str()).unwrap();

        let received = server.recv().unwrap();
        assert_eq!(received.data(), request.as_bytes(), "round {round}");

        server.send(received.data().to_vec()).unwrap();

        let reply = client.recv().unwrap();
        assert_eq!(reply.data(), request.as_bytes(), "round {round}");
    }

    drop(client);
    drop(server);
    ctx.term().unwrap();
}
