//! Echo client: dials the given address, sends a few messages, and
//! prints the round-trip results.
//!
//! ```text
//! cargo run --example echo_client -- shm://demo_bus "hello there"
//! ```

use std::time::{Duration, Instant};

use sluice::{DialOptions, Message, RecvOptions, SendOptions};

fn main() -> sluice::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "shm://demo_bus".to_string());
    let payload = args.next().unwrap_or_else(|| "ping".to_string());

    let pipe = sluice::dial(&address, &DialOptions::default())?;
    let recv_opts = RecvOptions::with_timeout(Duration::from_secs(5));

    for i in 0..5 {
        let msg = Message::from_string(&format!("{payload} #{i}"));
        let start = Instant::now();
        pipe.send(&msg, &SendOptions::default())?;
        let echoed = pipe.recv(&recv_opts)?;
        println!(
            "echo {:?} in {:?}",
            String::from_utf8_lossy(echoed.as_slice()),
            start.elapsed()
        );
    }

    pipe.close();
    Ok(())
}
