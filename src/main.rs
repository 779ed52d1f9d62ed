use std::io;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vex_serial::devices::v5::WirelessRelay;
use vex_serial::devices::{AnyDevice, DeviceConfig, FileSystemDevice};
use vex_serial::io::BAUD_RATE;
use vex_serial::ports::{find_devices, VexSerialDevice};
use vex_serial::stream::{Shutdown, StreamReader, StreamWriter, Terminal};
use vex_serial::v5::FileTransferVID;

/// How often an idle relay asks the controller for more output
const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(50);

type Input = Box<dyn AsyncRead + Unpin + Send>;
type Output = Box<dyn AsyncWrite + Unpin + Send>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    // Prefer a brain's user port, fall back to relaying through a controller
    let devices = find_devices()?;
    let device = devices
        .iter()
        .find(|d| d.user_port().is_some())
        .or_else(|| devices.iter().find(|d| matches!(d, VexSerialDevice::V5Controller { .. })))
        .cloned()
        .context("no V5 brain or controller found")?;

    let target = device.clone();
    let v5 = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let mut opened = AnyDevice::open(&target, DeviceConfig::default())?;
        let fs = opened
            .as_file_system()
            .context("device does not store files")?;

        let status = fs.status()?;
        println!("VEXos {} (system id {:#010x})", status.system_version, status.system_id);
        for file in fs.list_files(FileTransferVID::User)? {
            println!("{:>3} {:<24} {:>8} bytes  {}", file.idx, file.file_name(), file.length, file.file_type);
        }

        match opened {
            AnyDevice::V5(v5) => Ok(v5),
            _ => anyhow::bail!("device is not a V5"),
        }
    })
    .await??;

    let shutdown = Shutdown::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.trigger();
        }
    });

    match device.user_port() {
        Some(user_port) => {
            drop(v5);
            info!(port = %user_port.name(), "attaching terminal");
            let port = tokio_serial::new(user_port.name(), BAUD_RATE).open_native_async()?;
            let (reader, writer) = tokio::io::split(port);
            attach(Box::new(reader), Box::new(writer), shutdown).await?;
        }
        None => {
            info!(port = %v5.channel_name(), "attaching terminal through controller");
            let relay = tokio::task::spawn_blocking(move || WirelessRelay::open(v5)).await??;
            let (reader, pump) = relay.spawn_reader(RELAY_POLL_INTERVAL);
            attach(Box::new(reader), Box::new(tokio::io::sink()), shutdown).await?;
            let relay = pump.await??;
            tokio::task::spawn_blocking(move || relay.close()).await??;
        }
    }
    Ok(())
}

async fn attach(reader: Input, writer: Output, shutdown: Shutdown) -> anyhow::Result<()> {
    Terminal::new(StreamReader::new(reader), StreamWriter::new(writer))
        .run(tokio::io::stdin(), tokio::io::stdout(), shutdown)
        .await?;
    Ok(())
}
