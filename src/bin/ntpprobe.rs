//! Query an NTP server and print what it claims about itself.

use anyhow::{anyhow, Result};
use clap::Parser;
use rsntp::SntpClient;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "NTP probe", long_about = None)]
struct Args {
    /// Server to query
    #[arg(default_value = "127.0.0.1")]
    server: String,

    /// Number of queries
    #[arg(short = 'n', long, default_value_t = 4)]
    count: u32,

    /// Seconds between queries
    #[arg(short, long, default_value_t = 1)]
    interval: u64,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("warn"));
    let args = Args::parse();

    let mut client = SntpClient::new();
    client.set_timeout(Duration::from_secs(2));

    println!("=== NTP probe: {} ===\n", args.server);
    println!(
        "{:>4} {:>14} {:>12} {:>8} {:>10} {:>10}",
        "#", "Offset (us)", "Delay (us)", "Stratum", "Leap", "RefID"
    );
    println!("{}", "-".repeat(64));

    let mut offsets = Vec::new();
    for i in 0..args.count {
        match client.synchronize(&args.server) {
            Ok(result) => {
                let offset_us = result.clock_offset().as_secs_f64() * 1e6;
                let delay_us = result.round_trip_delay().as_secs_f64() * 1e6;
                offsets.push(offset_us);
                println!(
                    "{:>4} {:>+14.1} {:>12.1} {:>8} {:>10} {:>10}",
                    i,
                    offset_us,
                    delay_us,
                    result.stratum(),
                    format!("{:?}", result.leap_indicator()),
                    format!("{:?}", result.reference_identifier()),
                );
            }
            Err(e) => println!("{:>4} error: {}", i, e),
        }
        if i + 1 < args.count {
            std::thread::sleep(Duration::from_secs(args.interval));
        }
    }

    if offsets.is_empty() {
        return Err(anyhow!("no response from {}", args.server));
    }
    let mean = offsets.iter().sum::<f64>() / offsets.len() as f64;
    println!("\nMean offset over {} replies: {:+.1} us", offsets.len(), mean);
    Ok(())
}
