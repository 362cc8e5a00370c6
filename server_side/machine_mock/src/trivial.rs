use std::{future::Future, pin::pin};

use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};

const GREETING: &[u8] = b"Grbl 1.1h ['$' for help]\n";

fn status_report(held: bool) -> Vec<u8> {
    let state = if held { "Hold:0" } else { "Idle" };
    format!("<{}|MPos:0.000,1.000,3.000|FS:100,500|Bf:15,128|WCO:5.000,-5.250,17.000|Ov:100,100,100>\n", state).into_bytes()
}

/// Speaks enough of the Grbl serial protocol to drive a controller: a greeting, `ok` per line,
/// status reports, feed hold and resume, and soft reset. Returns every line it acknowledged.
pub fn recording_machine(input: impl AsyncRead, output: impl AsyncWrite) -> impl Future<Output=Vec<String>> {
    async move {
        let mut input = pin!(input);
        let mut output = pin!(output);
        let mut received = Vec::new();
        let mut current = Vec::new();
        let mut held = false;
        drop(output.write_all(GREETING).await);
        loop {
            let value = match input.read_u8().await {
                Ok(value) => value,
                Err(_) => return received,
            };
            match value {
                b'\n' => {
                    received.push(String::from_utf8_lossy(&current).into_owned());
                    current.clear();
                    drop(output.write_all(b"ok\n").await)
                },
                b'\r' => (),
                b'?' => drop(output.write_all(&status_report(held)).await),
                b'!' => held = true,
                b'~' => held = false,
                0x18 => {
                    held = false;
                    current.clear();
                    drop(output.write_all(GREETING).await)
                },
                // Remaining realtime bytes (overrides, jog cancel) are swallowed.
                0x80..=0xFF => (),
                other => current.push(other),
            }
        }
    }
}

pub async fn trivial_machine(input: impl AsyncRead, output: impl AsyncWrite) {
    recording_machine(input, output).await;
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn test_acknowledges_lines() {
        let (machine_side, host_side) = duplex(1024);
        let (machine_read, machine_write) = tokio::io::split(machine_side);
        let (host_read, mut host_write) = tokio::io::split(host_side);
        let machine = tokio::spawn(recording_machine(machine_read, machine_write));
        let mut lines = BufReader::new(host_read).lines();
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("Grbl"));
        host_write.write_all(b"G0 X1\n!?").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "ok");
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("<Hold:0|"));
        drop(host_write);
        drop(lines);
        assert_eq!(machine.await.unwrap(), vec!["G0 X1".to_string()]);
    }
}
