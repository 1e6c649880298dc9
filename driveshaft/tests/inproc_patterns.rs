//! Pattern behavior over the inproc transport.

use std::time::Duration;

use driveshaft::zmq::{Context, Socket, SocketOption, SocketType};

/// Connect-before-bind: messages queue on the parked pipe and arrive
/// once somebody binds the name.
#[test]
fn pair_connect_before_bind() {
    driveshaft::dev_tracing::init_tracing();

    let ctx = Context::new().unwrap();

    let mut early = Socket::new(&ctx, SocketType::Pair).unwrap();
    early.connect("inproc://late-bind").unwrap();
    early.send("sent into the void").unwrap();

    let mut late = Socket::new(&ctx, SocketType::Pair).unwrap();
    late.set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(5))))
        .unwrap();
    late.bind("inproc://late-bind").unwrap();

    let msg = late.recv().unwrap();
    assert_eq!(msg.data(), b"sent into the void");

    // And the link is fully duplex after the late bind.
    late.send("echo").unwrap();
    early
        .set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(5))))
        .unwrap();
    assert_eq!(early.recv().unwrap().data(), b"echo");

    drop(early);
    drop(late);
    ctx.term().unwrap();
}

/// REQ/REP alternation with automatic envelope handling.
#[test]
fn req_rep_round_trip() {
    driveshaft::dev_tracing::init_tracing();

    let ctx = Context::new().unwrap();

    let mut rep = Socket::new(&ctx, SocketType::Rep).unwrap();
    rep.set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(5))))
        .unwrap();
    rep.bind("inproc://service").unwrap();

    let mut req = Socket::new(&ctx, SocketType::Req).unwrap();
    req.set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(5))))
        .unwrap();
    req.connect("inproc://service").unwrap();

    // Out-of-order operations are refused.
    assert!(req.recv().is_err());

    for i in 0..10 {
        req.send(format!("ping-{i}").as_str()).unwrap();

        // A second send before the reply violates the state machine.
        let premature = req.send("again");
        assert!(matches!(
            premature,
            Err(driveshaft::DriveshaftError::InvalidState(_))
        ));

        let request = rep.recv().unwrap();
        assert_eq!(request.data(), format!("ping-{i}").as_bytes());
        assert!(!rep.rcvmore());

        rep.send(format!("pong-{i}").as_str()).unwrap();

        let reply = req.recv().unwrap();
        assert_eq!(reply.data(), format!("pong-{i}").as_bytes());
    }

    drop(req);
    drop(rep);
    ctx.term().unwrap();
}

/// ROUTER sees an identity frame in front of every DEALER message and
/// routes replies by that identity.
#[test]
fn router_dealer_envelopes() {
    driveshaft::dev_tracing::init_tracing();

    let ctx = Context::new().unwrap();

    let mut router = Socket::new(&ctx, SocketType::Router).unwrap();
    router
        .set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(5))))
        .unwrap();
    router.bind("inproc://routing").unwrap();

    let mut dealer = Socket::new(&ctx, SocketType::Dealer).unwrap();
    dealer
        .set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(5))))
        .unwrap();
    dealer.connect("inproc://routing").unwrap();

    dealer.send("question").unwrap();

    let parts = router.recv_multipart().unwrap();
    assert_eq!(parts.len(), 2, "identity frame missing");
    let identity = parts[0].data().to_vec();
    assert!(!identity.is_empty());
    assert_eq!(parts[1].data(), b"question");

    router
        .send_multipart([identity.clone(), b"answer".to_vec()])
        .unwrap();

    let reply = dealer.recv().unwrap();
    assert_eq!(reply.data(), b"answer");
    assert!(!dealer.rcvmore());

    drop(dealer);
    drop(router);
    ctx.term().unwrap();
}

/// PUB/SUB over inproc respects subscriptions established before the
/// connect.
#[test]
fn pubsub_inproc_filtering() {
    driveshaft::dev_tracing::init_tracing();

    let ctx = Context::new().unwrap();

    let mut publisher = Socket::new(&ctx, SocketType::Pub).unwrap();
    publisher.bind("inproc://feed").unwrap();

    let mut subscriber = Socket::new(&ctx, SocketType::Sub).unwrap();
    subscriber
        .set_option(SocketOption::RecvTimeout(Some(Duration::from_millis(500))))
        .unwrap();
    subscriber
        .set_option(SocketOption::Subscribe(bytes::Bytes::from_static(b"keep.")))
        .unwrap();
    subscriber.connect("inproc://feed").unwrap();

    publisher.send("drop.one").unwrap();
    publisher.send("keep.two").unwrap();
    publisher.send("drop.three").unwrap();
    publisher.send("keep.four").unwrap();

    assert_eq!(subscriber.recv().unwrap().data(), b"keep.two");
    assert_eq!(subscriber.recv().unwrap().data(), b"keep.four");
    assert!(subscriber.recv().is_err(), "filtered message surfaced");

    drop(publisher);
    drop(subscriber);
    ctx.term().unwrap();
}
