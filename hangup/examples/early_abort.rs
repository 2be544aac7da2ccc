//! Example: abort work when the client disconnects

use hangup::CancelToken;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

fn main() {
    // Bind a TCP listener on an ephemeral port
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    println!("Listening on {}", addr);

    // A client that gives up after 200ms
    thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(200));
        drop(stream);
    });

    let (stream, peer) = listener.accept().unwrap();
    println!("Accepted connection from {}", peer);

    // Cancelled by the client leaving or by the 5s request deadline
    let request = CancelToken::new();
    request.cancel_after(Duration::from_secs(5));
    let work = hangup::with_cancellation(&request, &stream);

    let mut steps = 0;
    while !work.is_cancelled() {
        // One slice of expensive work
        thread::sleep(Duration::from_millis(20));
        steps += 1;
    }

    println!("Stopped after {} steps: {}", steps, work.wait());
}
