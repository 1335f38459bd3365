//! Echo server: accepts pipes on the given address and echoes every
//! message back.
//!
//! ```text
//! cargo run --example echo_server -- shm://demo_bus
//! cargo run --example echo_server -- tcp://127.0.0.1:7777
//! ```

use sluice::{ListenOptions, RecvOptions, SendOptions, StatusCode};

fn main() -> sluice::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "shm://demo_bus".to_string());

    let listener = sluice::listen(&address, &ListenOptions::default())?;
    println!("listening on {}", listener.local_address()?);

    loop {
        let pipe = match listener.accept() {
            Ok(pipe) => pipe,
            Err(st) if st.code() == StatusCode::Closed => return Ok(()),
            Err(st) => {
                eprintln!("accept failed: {st}");
                continue;
            }
        };

        std::thread::spawn(move || {
            let mut echoed = 0u64;
            loop {
                match pipe.recv(&RecvOptions::default()) {
                    Ok(msg) => {
                        if let Err(st) = pipe.send(&msg, &SendOptions::default()) {
                            eprintln!("echo send failed: {st}");
                            break;
                        }
                        echoed += 1;
                    }
                    Err(st) if st.code() == StatusCode::Closed => break,
                    Err(st) => {
                        eprintln!("recv failed: {st}");
                        break;
                    }
                }
            }
            println!("connection done after {echoed} messages");
        });
    }
}
