//! Basic usage example for pooled-sftp
//!
//! This example demonstrates how to:
//! - Build a client over the in-memory transport
//! - Upload a directory tree with a progress callback
//! - Inspect the pool and shut it down
//!
//! Run with: `cargo run --example basic_usage`

use std::sync::Arc;

use pooled_sftp::config::ClientConfig;
use pooled_sftp::ssh::{MemoryTransport, ProgressCallback, SftpClient, TransferProgress};

#[tokio::main]
async fn main() -> pooled_sftp::Result<()> {
    let transport = MemoryTransport::new();
    let config = ClientConfig::with_password("demo.example", "demo", "demo");

    let local = std::env::temp_dir().join("pooled-sftp-demo");
    std::fs::create_dir_all(local.join("docs"))?;
    std::fs::write(local.join("README.txt"), b"hello from pooled-sftp\n")?;
    std::fs::write(local.join("docs/notes.txt"), vec![b'n'; 100_000])?;

    let progress: ProgressCallback = Arc::new(|p: TransferProgress| {
        println!("  {} {:>6.1}%", p.path, p.percent());
    });

    SftpClient::scoped(config, Arc::new(transport.clone()), |client| async move {
        println!("=== Uploading {} ===", local.display());
        let summary = client.put_dir(&local, "/upload", Some(progress)).await?;
        println!(
            "{} files, {} bytes, {} directories created",
            summary.files_transferred, summary.bytes_transferred, summary.directories_created
        );

        println!("\n=== Remote listing ===");
        for entry in client.read_dir("/upload").await? {
            println!("  {:<12} {:>8} bytes", entry.name, entry.attrs.size.unwrap_or(0));
        }

        println!("\n=== Pool ===");
        println!("  {:?}", client.stats());
        Ok(())
    })
    .await?;

    println!("\nLive sessions after shutdown: {}", transport.live_sessions());
    Ok(())
}
