//! Reconnect backoff against a dead endpoint.
//!
//! With no listener, each failed connect schedules a retry after the
//! current interval plus up to one base interval of jitter, doubling
//! toward the ceiling. The monitor reports every retry with the
//! interval used.

use std::time::Duration;

use driveshaft::zmq::{Context, Socket, SocketEvent, SocketOption, SocketType};

#[test]
fn retries_with_growing_jittered_backoff() {
    driveshaft::dev_tracing::init_tracing();

    // Picked and *not* bound: nobody is listening here.
    let port = portpicker::pick_unused_port().expect("free port");
    let endpoint = format!("tcp://127.0.0.1:{port}");

    let ctx = Context::new().unwrap();

    let mut dealer = Socket::new(&ctx, SocketType::Dealer).unwrap();
    dealer
        .set_option(SocketOption::ReconnectIvl(Duration::from_millis(100)))
        .unwrap();
    dealer
        .set_option(SocketOption::ReconnectIvlMax(Duration::from_millis(2000)))
        .unwrap();
    let monitor = dealer.monitor();
    dealer.connect(&endpoint).unwrap();

    let mut intervals = Vec::new();
    while intervals.len() < 3 {
        match monitor.recv_timeout(Duration::from_secs(10)) {
            Ok(SocketEvent::ConnectRetried { interval, .. }) => intervals.push(interval),
            Ok(_) => {}
            Err(e) => panic!("no retry event: {e}"),
        }
    }

    // interval_n = current_n + jitter, jitter in [0, 100ms); the
    // current interval doubles from 100ms toward the 2s ceiling.
    let base = Duration::from_millis(100);
    let ceiling = Duration::from_millis(2000) + base;
    let mut floor = base;
    for (n, interval) in intervals.iter().enumerate() {
        assert!(
            *interval >= floor && *interval < floor + base,
            "retry {n} interval {interval:?} outside [{floor:?}, {floor:?}+100ms)"
        );
        assert!(*interval <= ceiling);
        floor = (floor * 2).min(Duration::from_millis(2000));
    }
    // The observed sequence is non-decreasing.
    assert!(intervals.windows(2).all(|w| w[0] <= w[1]));

    drop(dealer);
    ctx.term().unwrap();
}
