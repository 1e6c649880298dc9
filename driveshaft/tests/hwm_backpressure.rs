//! High-water-mark backpressure on an inproc pipeline.
//!
//! Inproc pipes carry a combined limit of sender SNDHWM plus receiver
//! RCVHWM. At the mark the next non-blocking send refuses; draining
//! to the low-water mark returns credit and reopens exactly that much
//! room.

use driveshaft::zmq::{Context, Socket, SocketOption, SocketType};

#[test]
fn hwm_refuses_then_credit_reopens() {
    driveshaft::dev_tracing::init_tracing();

    let ctx = Context::new().unwrap();

    let mut pull = Socket::new(&ctx, SocketType::Pull).unwrap();
    pull.set_option(SocketOption::RecvHwm(5)).unwrap();
    pull.bind("inproc://pipeline").unwrap();

    let mut push = Socket::new(&ctx, SocketType::Push).unwrap();
    push.set_option(SocketOption::SendHwm(5)).unwrap();
    push.connect("inproc://pipeline").unwrap();

    // Combined capacity: 5 + 5 = 10 messages.
    for i in 0..10 {
        push.try_send(format!("msg-{i}").as_str())
            .unwrap_or_else(|e| panic!("send {i} refused: {e}"));
    }
    let over = push.try_send("over-the-mark");
    assert!(
        matches!(over, Err(e) if e.is_would_block()),
        "11th send must refuse"
    );

    // Drain to the low-water mark: (10 + 1) / 2 = 5 reads send credit.
    for i in 0..5 {
        let msg = pull.try_recv().unwrap();
        assert_eq!(msg.data(), format!("msg-{i}").as_bytes());
    }

    // Exactly five more fit.
    for i in 10..15 {
        push.try_send(format!("msg-{i}").as_str())
            .unwrap_or_else(|e| panic!("post-credit send {i} refused: {e}"));
    }
    let over = push.try_send("over-again");
    assert!(matches!(over, Err(e) if e.is_would_block()));

    // Everything queued is still delivered in order.
    for i in 5..15 {
        let msg = pull.try_recv().unwrap();
        assert_eq!(msg.data(), format!("msg-{i}").as_bytes());
    }

    drop(push);
    drop(pull);
    ctx.term().unwrap();
}
