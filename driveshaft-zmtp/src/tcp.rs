//! TCP socket tuning.
//!
//! Applied to every connected or accepted socket before it is handed
//! to an engine: Nagle off always, then whatever keepalive, TOS and
//! buffer sizing the options ask for.

use std::io;

use socket2::{Socket, TcpKeepalive};

use driveshaft_core::options::Options;

pub(crate) fn tune_socket(sock: &Socket, options: &Options) -> io::Result<()> {
    sock.set_nodelay(true)?;

    match options.keepalive.enabled {
        Some(true) => {
            let mut keepalive = TcpKeepalive::new();
            if let Some(idle) = options.keepalive.idle {
                keepalive = keepalive.with_time(idle);
            }
            if let Some(interval) = options.keepalive.interval {
                keepalive = keepalive.with_interval(interval);
            }
            if let Some(count) = options.keepalive.count {
                keepalive = keepalive.with_retries(count);
            }
            sock.set_tcp_keepalive(&keepalive)?;
        }
        Some(false) => sock.set_keepalive(false)?,
        None => {}
    }

    if options.tos != 0 {
        sock.set_tos(options.tos)?;
    }
    if let Some(size) = options.sndbuf {
        sock.set_send_buffer_size(size)?;
    }
    if let Some(size) = options.rcvbuf {
        sock.set_recv_buffer_size(size)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use driveshaft_core::options::SocketOption;
    use driveshaft_core::socket_type::SocketType;
    use socket2::{Domain, Protocol, Type};
    use std::time::Duration;

    #[test]
    fn test_tune_applies_options() {
        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let mut options = Options::new(SocketType::Dealer);
        options.set(SocketOption::TcpKeepalive(Some(true))).unwrap();
        options
            .set(SocketOption::TcpKeepaliveIdle(Duration::from_secs(30)))
            .unwrap();
        options.set(SocketOption::SendBuffer(65536)).unwrap();

        tune_socket(&sock, &options).unwrap();
        assert!(sock.nodelay().unwrap());
        assert!(sock.keepalive().unwrap());
    }
}
