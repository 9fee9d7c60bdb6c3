//! Firewall block requests.
//!
//! Sends `add <ip> <seconds>\n` to the block service over a short-lived
//! TCP connection. Runs on the background queue; failures are logged by
//! the queue and never reach the client.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::lifecycle::{TaskError, TaskQueue};
use crate::observability::metrics;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct BlockNotifier {
    addr: String,
    tasks: TaskQueue,
}

impl BlockNotifier {
    pub fn new(addr: impl Into<String>, tasks: TaskQueue) -> Self {
        Self {
            addr: addr.into(),
            tasks,
        }
    }

    /// Queue a block request for `ip`.
    pub fn block(&self, ip: IpAddr, seconds: u64) -> bool {
        let addr = self.addr.clone();
        metrics::record_ip_block();
        self.tasks
            .submit("ip_block", async move { send_block(&addr, ip, seconds).await })
    }
}

pub async fn send_block(addr: &str, ip: IpAddr, seconds: u64) -> Result<(), TaskError> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TaskError::Timeout)??;
    stream
        .write_all(format!("add {ip} {seconds}\n").as_bytes())
        .await?;
    stream.shutdown().await?;
    tracing::info!(ip = %ip, seconds, "Block request sent");
    Ok(())
}
