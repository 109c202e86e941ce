//! Live environmental sensor monitor example
//!
//! Run with: cargo run --example env_monitor
//!
//! Set `RUST_LOG=env_sensors_ble=debug` to watch the session state machine.

use env_sensors_ble::{MonitorConfig, ReadingKind, Result, SensorMonitor};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("Environmental Sensor Monitor");
    println!("============================\n");

    let config = MonitorConfig::default().with_rescan_interval(Duration::from_secs(20));
    println!("Looking for \"{}\"...\n", config.target_name);

    let monitor = SensorMonitor::with_config(config).await?;

    let _readings = monitor.on_reading(None, |reading| {
        println!("{}", reading);
    });
    let _co2 = monitor.on_reading(Some(ReadingKind::Co2), |reading| {
        if reading.value > 1500.0 {
            println!("  ventilate! CO2 at {:.0} ppm", reading.value);
        }
    });

    monitor.start().await?;
    println!("Press Ctrl+C to exit.\n");

    let mut status = tokio::time::interval(Duration::from_secs(30));
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n\nExiting...");
                break;
            }
            _ = status.tick() => {
                display_snapshot(&monitor);
            }
        }
    }

    monitor.shutdown().await?;
    Ok(())
}

fn display_snapshot<R: env_sensors_ble::RadioAdapter>(monitor: &SensorMonitor<R>) {
    let snapshot = monitor.snapshot();
    println!("--- {} ---", monitor.phase());
    for kind in ReadingKind::ALL {
        match snapshot.get(kind) {
            Some(value) => println!("{:>12}: {:.2} {}", kind.to_string(), value, kind.unit()),
            None => println!("{:>12}: --", kind.to_string()),
        }
    }
}
