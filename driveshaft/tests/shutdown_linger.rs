//! Close-time draining under the linger policy.

use std::time::Duration;

use driveshaft::zmq::{Context, Socket, SocketOption, SocketType};

/// Messages queued at close time still reach the peer while linger
/// allows draining — even when close happens before the connection
/// has finished establishing.
#[test]
fn close_drains_queued_messages() {
    driveshaft::dev_tracing::init_tracing();

    let port = portpicker::pick_unused_port().expect("free port");
    let endpoint = format!("tcp://127.0.0.1:{port}");

    let ctx = Context::new().unwrap();

    let mut pull = Socket::new(&ctx, SocketType::Pull).unwrap();
    pull.set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(10))))
        .unwrap();
    pull.bind(&endpoint).unwrap();

    let mut push = Socket::new(&ctx, SocketType::Push).unwrap();
    push.set_option(SocketOption::Linger(Some(Duration::from_secs(5))))
        .unwrap();
    push.connect(&endpoint).unwrap();

    for i in 0..5 {
        push.send(format!("queued-{i}").as_str()).unwrap();
    }
    // Close immediately; the runtime drains in the background.
    push.close();

    for i in 0..5 {
        let msg = pull.recv().unwrap();
        assert_eq!(msg.data(), format!("queued-{i}").as_bytes());
    }

    drop(pull);
    ctx.term().unwrap();
}

/// A receive blocked on an idle socket unwinds with the terminated
/// error as soon as the context starts shutting down.
#[test]
fn terminating_context_unblocks_blocked_recv() {
    driveshaft::dev_tracing::init_tracing();

    let ctx = Context::new().unwrap();
    let mut idle = Socket::new(&ctx, SocketType::Pull).unwrap();
    idle.bind("inproc://nothing-ever-comes").unwrap();

    let receiver = std::thread::spawn(move || {
        let result = idle.recv();
        assert!(
            matches!(result, Err(ref e) if e.is_terminated()),
            "blocked recv ended with {result:?}"
        );
        drop(idle);
    });

    // Give the receiver time to park, then tear the context down; term
    // returns only after the receiver noticed and closed its socket.
    std::thread::sleep(Duration::from_millis(50));
    ctx.term().unwrap();
    receiver.join().unwrap();
}

/// With linger zero the queue is abandoned: nothing may surface even
/// if a listener appears right after the close.
#[test]
fn linger_zero_drops_queued_messages() {
    driveshaft::dev_tracing::init_tracing();

    let port = portpicker::pick_unused_port().expect("free port");
    let endpoint = format!("tcp://127.0.0.1:{port}");

    let ctx = Context::new().unwrap();

    let mut push = Socket::new(&ctx, SocketType::Push).unwrap();
    push.set_option(SocketOption::Linger(Some(Duration::ZERO)))
        .unwrap();
    // Nobody is listening yet; everything queues.
    push.connect(&endpoint).unwrap();
    for i in 0..3 {
        push.send(format!("doomed-{i}").as_str()).unwrap();
    }
    push.close();

    // The socket is gone before this listener exists.
    let mut pull = Socket::new(&ctx, SocketType::Pull).unwrap();
    pull.set_option(SocketOption::RecvTimeout(Some(Duration::from_millis(300))))
        .unwrap();
    pull.bind(&endpoint).unwrap();

    let result = pull.recv();
    assert!(
        matches!(result, Err(ref e) if e.is_would_block()),
        "dropped messages surfaced: {result:?}"
    );

    drop(pull);
    ctx.term().unwrap();
}
