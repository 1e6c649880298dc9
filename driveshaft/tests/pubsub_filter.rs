//! Pub/sub prefix filtering over TCP.
//!
//! A publisher emits weather lines for two zip codes; a subscriber
//! filtered to one of them must see only matching lines, and its
//! average temperature must equal the mean of what was delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use driveshaft::zmq::{Context, Socket, SocketOption, SocketType};

#[test]
fn subscriber_sees_only_matching_topic() {
    driveshaft::dev_tracing::init_tracing();

    let port = portpicker::pick_unused_port().expect("free port");
    let endpoint = format!("tcp://127.0.0.1:{port}");

    let ctx = Context::new().unwrap();

    let mut publisher = Socket::new(&ctx, SocketType::Pub).unwrap();
    publisher.bind(&endpoint).unwrap();

    let mut subscriber = Socket::new(&ctx, SocketType::Sub).unwrap();
    subscriber
        .set_option(SocketOption::RecvTimeout(Some(Duration::from_secs(10))))
        .unwrap();
    subscriber
        .set_option(SocketOption::Subscribe(Bytes::from_static(b"10001 ")))
        .unwrap();
    subscriber.connect(&endpoint).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let publisher_stop = Arc::clone(&stop);
    let publisher_thread = thread::spawn(move || {
        let mut i = 0u32;
        while !publisher_stop.load(Ordering::Relaxed) {
            let temperature = 20 + (i % 10);
            let humidity = 50 + (i % 20);
            publisher
                .send(format!("10001 {temperature} {humidity}").as_str())
                .unwrap();
            publisher
                .send(format!("10002 {} {humidity}", temperature + 40).as_str())
                .unwrap();
            i += 1;
            thread::sleep(Duration::from_millis(1));
        }
        publisher
    });

    let mut temperatures = Vec::with_capacity(100);
    while temperatures.len() < 100 {
        let msg = subscriber.recv().unwrap();
        let line = std::str::from_utf8(msg.data()).unwrap();
        assert!(line.starts_with("10001 "), "filtered topic leaked: {line}");
        let mut fields = line.split_whitespace();
        fields.next(); // zip
        let temperature: f64 = fields.next().unwrap().parse().unwrap();
        temperatures.push(temperature);
    }

    stop.store(true, Ordering::Relaxed);
    let publisher = publisher_thread.join().unwrap();

    let average = temperatures.iter().sum::<f64>() / temperatures.len() as f64;
    let expected = temperatures.iter().sum::<f64>() / 100.0;
    assert!((average - expected).abs() < f64::EPSILON);
    // The emitted temperatures all sit in [20, 30).
    assert!(average >= 20.0 && average < 30.0, "average {average}");

    drop(subscriber);
    drop(publisher);
    ctx.term().unwrap();
}
