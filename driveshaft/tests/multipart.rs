//! Multipart atomicity: frame boundaries and MORE flags survive every
//! hop, and messages never interleave.

use std::time::Duration;

use driveshaft::zmq::{Context, Msg, Socket, SocketOption, SocketType};

#[test]
fn three_frame_message_arrives_intact() {
    driveshaft::dev_tracing::init_tracing();

    let port = portpicker::pick_unused_port().expect("free port");
    let endpoint = format!("tcp://127.0.0.1:{port}");

    let ctx = Context::new().unwrap();

    let mut receiver = Socket::new(&ctx, SocketType::Dealer).unwrap();
    receiver
        .set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(10))))
        .unwrap();
    receiver.bind(&endpoint).unwrap();

    let mut sender = Socket::new(&ctx, SocketType::Dealer).unwrap();
    sender.connect(&endpoint).unwrap();

    // Two back-to-back multipart messages plus a single-frame chaser.
    for tag in ["first", "second"] {
        sender.send(Msg::from(tag).with_more(true)).unwrap();
        sender.send(Msg::from("middle").with_more(true)).unwrap();
        sender.send(Msg::from("tail")).unwrap();
    }
    sender.send(Msg::from("single")).unwrap();

    for tag in ["first", "second"] {
        let parts = receiver.recv_multipart().unwrap();
        assert_eq!(parts.len(), 3, "message {tag} fragmented");
        assert_eq!(parts[0].data(), tag.as_bytes());
        assert!(parts[0].has_more());
        assert_eq!(parts[1].data(), b"middle");
        assert!(parts[1].has_more());
        assert_eq!(parts[2].data(), b"tail");
        assert!(!parts[2].has_more());
    }

    let parts = receiver.recv_multipart().unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].data(), b"single");

    drop(sender);
    drop(receiver);
    ctx.term().unwrap();
}

#[test]
fn send_multipart_sets_flags() {
    driveshaft::dev_tracing::init_tracing();

    let ctx = Context::new().unwrap();

    let mut a = Socket::new(&ctx, SocketType::Pair).unwrap();
    a.bind("inproc://frames").unwrap();
    let mut b = Socket::new(&ctx, SocketType::Pair).unwrap();
    b.set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(5))))
        .unwrap();
    b.connect("inproc://frames").unwrap();

    a.send_multipart(["alpha", "beta", "gamma"]).unwrap();

    let parts = b.recv_multipart().unwrap();
    assert_eq!(parts.len(), 3);
    assert!(parts[0].has_more());
    assert!(parts[1].has_more());
    assert!(!parts[2].has_more());
    assert_eq!(parts[2].data(), b"gamma");

    drop(a);
    drop(b);
    ctx.term().unwrap();
}
