//! PTPv2 packet logger - shows T1 from Follow_Up, local T2 and their phase
//! difference, plus each grandmaster Announce.

use anyhow::Result;
use clap::Parser;
use rbsync::net::{create_multicast_socket, select_interface};
use rbsync::ptp::{parse_message, PtpMessage, PTP_EVENT_PORT, PTP_GENERAL_PORT};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(author, version, about = "PTPv2 raw offset logger", long_about = None)]
struct Args {
    /// Interface to join the multicast group on
    #[arg(short, long)]
    interface: Option<String>,

    /// Sync/Follow_Up pairs to collect
    #[arg(short = 'n', long, default_value_t = 50)]
    count: usize,
}

fn wall_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("warn"));
    let args = Args::parse();
    println!("=== PTP Raw Offset Logger ===\n");

    let iface = select_interface(args.interface.as_deref())?;
    let sock_event = create_multicast_socket(PTP_EVENT_PORT, iface.addr)?;
    let sock_general = create_multicast_socket(PTP_GENERAL_PORT, iface.addr)?;

    println!("Listening on {} ({}) ports 319/320...\n", iface.name, iface.addr);
    println!(
        "{:>6} {:>20} {:>20} {:>12}",
        "Seq", "T1 (ns mod 1s)", "T2 (ns mod 1s)", "Offset (us)"
    );
    println!("{}", "-".repeat(62));

    // seq -> local receive time of the Sync
    let mut pending: HashMap<u16, i64> = HashMap::new();
    let mut buf = [0u8; 2048];
    let mut offsets: Vec<f64> = Vec::new();

    while offsets.len() < args.count {
        if let Ok((size, _)) = sock_event.recv_from(&mut buf) {
            let t2_ns = wall_ns();
            if let Ok(PtpMessage::Sync { header, .. }) = parse_message(&buf[..size]) {
                pending.insert(header.sequence_id, t2_ns);
            }
        }

        if let Ok((size, src)) = sock_general.recv_from(&mut buf) {
            match parse_message(&buf[..size]) {
                Ok(PtpMessage::FollowUp { header, precise_origin }) => {
                    if let Some(t2_ns) = pending.remove(&header.sequence_id) {
                        let t1_mod = (precise_origin.to_nanos() % 1_000_000_000) as i64;
                        let t2_mod = t2_ns.rem_euclid(1_000_000_000);

                        let mut raw = t2_mod - t1_mod;
                        if raw > 500_000_000 {
                            raw -= 1_000_000_000;
                        }
                        if raw < -500_000_000 {
                            raw += 1_000_000_000;
                        }
                        let offset_us = raw as f64 / 1000.0;
                        offsets.push(offset_us);
                        println!(
                            "{:>6} {:>20} {:>20} {:>+12.1}",
                            header.sequence_id, t1_mod, t2_mod, offset_us
                        );
                    }
                }
                Ok(PtpMessage::Announce { body, .. }) => {
                    println!(
                        "  Announce from {} ({}): class {} accuracy 0x{:02x} source 0x{:02x} utc_offset {}",
                        body.grandmaster,
                        src,
                        body.clock_class,
                        body.clock_accuracy,
                        body.time_source,
                        body.current_utc_offset
                    );
                }
                _ => {}
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    if offsets.len() > 5 {
        offsets.sort_by(|a, b| a.total_cmp(b));
        let min = offsets[0];
        let max = offsets[offsets.len() - 1];
        let median = offsets[offsets.len() / 2];
        let mean: f64 = offsets.iter().sum::<f64>() / offsets.len() as f64;
        let variance: f64 =
            offsets.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / offsets.len() as f64;

        println!("\n{}", "=".repeat(62));
        println!("Statistics ({} samples):", offsets.len());
        println!("  Min offset:    {:+.1} us", min);
        println!("  Max offset:    {:+.1} us", max);
        println!("  Median offset: {:+.1} us", median);
        println!("  Mean offset:   {:+.1} us", mean);
        println!("  Std deviation: {:.1} us", variance.sqrt());
        println!("  Range:         {:.1} us", max - min);
    }

    println!("\n=== Done ===");
    Ok(())
}
